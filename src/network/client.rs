//! Client for the data server.
//!
//! # Example
//! ```no_run
//! use datalog::data::ReadingQuery;
//! use datalog::network::DataClient;
//!
//! # async fn example() -> datalog::error::AppResult<()> {
//! let mut client = DataClient::connect("localhost:8080").await?;
//! let channels = client.enabled_channels().await?;
//! let latest = client.readings(&ReadingQuery::new().latest().amount(10)).await?;
//! println!("{:?}: {} readings", channels, latest.len());
//! client.quit().await
//! # }
//! ```

use super::protocol::{
    parse_channels, read_response, write_line, DataFormat, Request, Response,
    ServerInfo,
};
use crate::data::{Reading, ReadingQuery, MAX_AMOUNT};
use crate::error::{AppResult, DaqError};
use futures::stream::{self, Stream};
use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::debug;

/// Time allowed for connecting and for each reply.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection to a data server.
#[derive(Debug)]
pub struct DataClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: SocketAddr,
    timeout: Duration,
}

impl DataClient {
    /// Connects with [`DEFAULT_TIMEOUT`].
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> AppResult<Self> {
        let socket = with_timeout(DEFAULT_TIMEOUT, TcpStream::connect(addr)).await??;
        let peer = socket.peer_addr()?;
        let (read_half, writer) = socket.into_split();
        debug!(%peer, "Connected to data server");
        Ok(Self {
            reader: BufReader::new(read_half),
            writer,
            peer,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Sets the reply timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Server address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Sends a request and waits for its reply frame.
    pub async fn request(&mut self, request: &Request) -> AppResult<Response> {
        write_line(&mut self.writer, &request.to_line()).await?;
        self.next_frame(self.timeout).await?.ok_or_else(|| {
            DaqError::Protocol("server closed the connection".to_string())
        })
    }

    async fn next_frame(&mut self, limit: Duration) -> AppResult<Option<Response>> {
        with_timeout(limit, read_response(&mut self.reader)).await?
    }

    async fn body(&mut self, request: &Request) -> AppResult<String> {
        self.request(request).await?.into_body()
    }

    /// Server time, ms since epoch.
    pub async fn timestamp(&mut self) -> AppResult<i64> {
        parse(&self.body(&Request::Timestamp).await?)
    }

    /// Device sample time, ms.
    pub async fn sample_time(&mut self) -> AppResult<u32> {
        parse(&self.body(&Request::SampleTime).await?)
    }

    /// When the device started streaming, ms since epoch.
    pub async fn stream_start_timestamp(&mut self) -> AppResult<i64> {
        parse(&self.body(&Request::StreamStartTimestamp).await?)
    }

    /// Enabled channels.
    pub async fn enabled_channels(&mut self) -> AppResult<Vec<u8>> {
        parse_channels(&self.body(&Request::EnabledChannels).await?)
    }

    /// Volts per count on `channel`.
    pub async fn volts_conversion(&mut self, channel: u8) -> AppResult<f64> {
        parse(&self.body(&Request::VoltsConversion(channel)).await?)
    }

    /// Server information.
    pub async fn info(&mut self) -> AppResult<ServerInfo> {
        let body = self.body(&Request::Info(Some(DataFormat::Json))).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Readings matching `query`, oldest first.
    pub async fn readings(&mut self, query: &ReadingQuery) -> AppResult<Vec<Reading>> {
        let body = self
            .body(&Request::from_query(query, DataFormat::Json))
            .await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Readings matching `query` as CSV lines.
    pub async fn readings_csv(&mut self, query: &ReadingQuery) -> AppResult<String> {
        self.body(&Request::from_query(query, DataFormat::Csv)).await
    }

    /// Ends the session.
    pub async fn quit(mut self) -> AppResult<()> {
        self.body(&Request::Quit).await.map(|_| ())
    }

    /// Polls for readings newer than `after` every `period`, yielding each
    /// one once in order. Ends after the first error. Must be called within a
    /// tokio runtime.
    pub fn poll_stream(
        self,
        after: i64,
        period: Duration,
    ) -> impl Stream<Item = AppResult<Reading>> + Send {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let state = PollState {
            client: self,
            last: after,
            pending: VecDeque::new(),
            ticker,
            failed: false,
        };

        stream::unfold(state, |mut state| async move {
            if state.failed {
                return None;
            }
            loop {
                if let Some(reading) = state.pending.pop_front() {
                    return Some((Ok(reading), state));
                }
                state.ticker.tick().await;
                let query = ReadingQuery::new().after(state.last).amount(MAX_AMOUNT);
                match state.client.readings(&query).await {
                    Ok(readings) => {
                        if let Some(newest) = readings.last() {
                            state.last = newest.reading_time();
                        }
                        state.pending.extend(readings);
                    }
                    Err(e) => {
                        state.failed = true;
                        return Some((Err(e), state));
                    }
                }
            }
        })
    }

    /// Subscribes to new readings, optionally restricted to `channels`.
    ///
    /// The stream ends when the server closes the connection.
    pub async fn subscribe(
        mut self,
        channels: Option<Vec<u8>>,
    ) -> AppResult<impl Stream<Item = AppResult<Reading>> + Send> {
        self.body(&Request::Subscribe(channels)).await?;

        Ok(stream::unfold(Some(self), |client| async move {
            let mut client = client?;
            loop {
                match read_response(&mut client.reader).await {
                    Ok(Some(Response::Data(json))) => {
                        return Some((Reading::from_json(&json), Some(client)));
                    }
                    Ok(Some(Response::Ok(_))) => continue,
                    Ok(Some(Response::Err(message))) => {
                        return Some((Err(DaqError::Remote(message)), None));
                    }
                    Ok(None) => return None,
                    Err(e) => return Some((Err(e), None)),
                }
            }
        }))
    }
}

struct PollState {
    client: DataClient,
    last: i64,
    pending: VecDeque<Reading>,
    ticker: tokio::time::Interval,
    failed: bool,
}

async fn with_timeout<F: Future>(limit: Duration, future: F) -> AppResult<F::Output> {
    timeout(limit, future)
        .await
        .map_err(|_| DaqError::Timeout(limit))
}

fn parse<T: std::str::FromStr>(body: &str) -> AppResult<T> {
    body.trim()
        .parse()
        .map_err(|_| DaqError::Protocol(format!("unexpected reply '{}'", body)))
}
