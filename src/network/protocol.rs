//! Line-oriented text protocol between data clients and the server.
//!
//! Clients send one command per line. The server answers every command with a
//! frame and keeps the connection open until the client sends `quit` or goes
//! away:
//!
//! ```text
//! OK <len>\n<body>\n       success, body is exactly <len> bytes
//! ERR <message>\n          failure, message is a single line
//! DATA <len>\n<json>\n     reading pushed to a subscribed client
//! ```
//!
//! The trailing newline after a body is not counted in `<len>`; it only keeps
//! the stream readable in a terminal.

use crate::data::{ReadingQuery, Selection};
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest request line accepted, in bytes.
pub const MAX_LINE_LEN: usize = 1024;

/// Largest response body accepted by a client, in bytes.
pub const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// Encoding of a readings body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    /// JSON array of reading objects.
    #[default]
    Json,
    /// One `time,v1,v2,...` line per reading.
    Csv,
}

impl FromStr for DataFormat {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => Err(DaqError::Protocol(format!("unknown format '{}'", other))),
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => f.write_str("json"),
            Self::Csv => f.write_str("csv"),
        }
    }
}

/// Optional `key=value` arguments of a readings request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// `amount=N`
    pub amount: Option<i64>,
    /// `fmt=json|csv`
    pub format: Option<DataFormat>,
    /// `channels=1,2,3`
    pub channels: Option<Vec<u8>>,
    /// `from=T`, inclusive
    pub from: Option<i64>,
    /// `until=T`, inclusive
    pub until: Option<i64>,
}

impl QueryOptions {
    /// Set the amount.
    pub fn with_amount(mut self, amount: i64) -> Self {
        self.amount = Some(amount);
        self
    }

    /// Set the body format.
    pub fn with_format(mut self, format: DataFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Restrict channels.
    pub fn with_channels(mut self, channels: Vec<u8>) -> Self {
        self.channels = Some(channels);
        self
    }

    fn parse<'a>(tokens: impl Iterator<Item = &'a str>) -> AppResult<Self> {
        let mut options = QueryOptions::default();
        for token in tokens {
            let (key, value) = token
                .split_once('=')
                .ok_or_else(|| DaqError::Protocol(format!("expected key=value, got '{}'", token)))?;
            match key.to_lowercase().as_str() {
                "amount" => options.amount = Some(parse_number(value, "amount")?),
                "fmt" | "format" => options.format = Some(value.parse()?),
                "channels" => options.channels = Some(parse_channels(value)?),
                "from" => options.from = Some(parse_number(value, "from")?),
                "until" => options.until = Some(parse_number(value, "until")?),
                other => return Err(DaqError::Protocol(format!("unknown option '{}'", other))),
            }
        }
        Ok(options)
    }

    fn write_to(&self, line: &mut String) {
        if let Some(amount) = self.amount {
            line.push_str(&format!(" amount={}", amount));
        }
        if let Some(format) = self.format {
            line.push_str(&format!(" fmt={}", format));
        }
        if let Some(channels) = &self.channels {
            line.push_str(&format!(" channels={}", join_channels(channels)));
        }
        if let Some(from) = self.from {
            line.push_str(&format!(" from={}", from));
        }
        if let Some(until) = self.until {
            line.push_str(&format!(" until={}", until));
        }
    }

    /// Store query for these options.
    ///
    /// `default_amount` applies when no amount was given; the result is capped
    /// at `max_amount`.
    pub fn to_query(&self, default_amount: i64, max_amount: i64) -> ReadingQuery {
        ReadingQuery {
            amount: Some(self.amount.unwrap_or(default_amount).min(max_amount)),
            from: self.from,
            until: self.until,
            channels: self.channels.clone(),
            ..ReadingQuery::default()
        }
    }
}

/// A client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `timestamp`: server time, ms since epoch.
    Timestamp,
    /// `sampletime`: device sample time, ms.
    SampleTime,
    /// `streamstarttimestamp`: when the device started streaming.
    StreamStartTimestamp,
    /// `enabledchannels`: comma-separated channel list.
    EnabledChannels,
    /// `voltsconversion <ch>`: volts per count on a channel.
    VoltsConversion(u8),
    /// `info [fmt=json|csv]`: server information.
    Info(Option<DataFormat>),
    /// `earliest [opts]`
    Earliest(QueryOptions),
    /// `latest [opts]`
    Latest(QueryOptions),
    /// `before <t> [opts]`: readings at or before `t`.
    Before(i64, QueryOptions),
    /// `after <t> [opts]`: readings after `t`.
    After(i64, QueryOptions),
    /// `dataafter <t>`: readings after `t` as CSV.
    DataAfter(i64),
    /// `subscribe [channels=..]`: push new readings until disconnect.
    Subscribe(Option<Vec<u8>>),
    /// `quit`: close the connection.
    Quit,
}

impl Request {
    /// Parses one request line.
    pub fn parse(line: &str) -> AppResult<Self> {
        let mut tokens = line.split_whitespace();
        let command = tokens
            .next()
            .ok_or_else(|| DaqError::Protocol("empty request".to_string()))?
            .to_lowercase();

        let request = match command.as_str() {
            "timestamp" => Request::Timestamp,
            "sampletime" => Request::SampleTime,
            "streamstarttimestamp" => Request::StreamStartTimestamp,
            "enabledchannels" => Request::EnabledChannels,
            "voltsconversion" => {
                let channel = required(tokens.next(), "channel")?;
                Request::VoltsConversion(parse_number(channel, "channel")?)
            }
            "info" => Request::Info(QueryOptions::parse(tokens.by_ref())?.format),
            "earliest" => Request::Earliest(QueryOptions::parse(tokens.by_ref())?),
            "latest" => Request::Latest(QueryOptions::parse(tokens.by_ref())?),
            "before" => {
                let time = parse_number(required(tokens.next(), "time")?, "time")?;
                Request::Before(time, QueryOptions::parse(tokens.by_ref())?)
            }
            "after" => {
                let time = parse_number(required(tokens.next(), "time")?, "time")?;
                Request::After(time, QueryOptions::parse(tokens.by_ref())?)
            }
            "dataafter" => {
                Request::DataAfter(parse_number(required(tokens.next(), "time")?, "time")?)
            }
            "subscribe" => Request::Subscribe(QueryOptions::parse(tokens.by_ref())?.channels),
            "quit" | "exit" => Request::Quit,
            other => return Err(DaqError::Protocol(format!("unknown command '{}'", other))),
        };

        if let Some(extra) = tokens.next() {
            return Err(DaqError::Protocol(format!("unexpected argument '{}'", extra)));
        }
        Ok(request)
    }

    /// The request as a command line, without the newline.
    pub fn to_line(&self) -> String {
        let mut line = String::new();
        match self {
            Request::Timestamp => line.push_str("timestamp"),
            Request::SampleTime => line.push_str("sampletime"),
            Request::StreamStartTimestamp => line.push_str("streamstarttimestamp"),
            Request::EnabledChannels => line.push_str("enabledchannels"),
            Request::VoltsConversion(channel) => {
                line.push_str(&format!("voltsconversion {}", channel))
            }
            Request::Info(format) => {
                line.push_str("info");
                if let Some(format) = format {
                    line.push_str(&format!(" fmt={}", format));
                }
            }
            Request::Earliest(options) => {
                line.push_str("earliest");
                options.write_to(&mut line);
            }
            Request::Latest(options) => {
                line.push_str("latest");
                options.write_to(&mut line);
            }
            Request::Before(time, options) => {
                line.push_str(&format!("before {}", time));
                options.write_to(&mut line);
            }
            Request::After(time, options) => {
                line.push_str(&format!("after {}", time));
                options.write_to(&mut line);
            }
            Request::DataAfter(time) => line.push_str(&format!("dataafter {}", time)),
            Request::Subscribe(channels) => {
                line.push_str("subscribe");
                if let Some(channels) = channels {
                    line.push_str(&format!(" channels={}", join_channels(channels)));
                }
            }
            Request::Quit => line.push_str("quit"),
        }
        line
    }

    /// Builds the readings request matching a store query.
    ///
    /// A pivot selects `after`/`before`; otherwise the selection picks
    /// `earliest`/`latest`.
    pub fn from_query(query: &ReadingQuery, format: DataFormat) -> Self {
        let options = QueryOptions {
            amount: query.amount,
            format: Some(format),
            channels: query.channels.clone(),
            from: query.from,
            until: query.until,
        };
        match (query.pivot, query.selection) {
            (Some(crate::data::Pivot::After(t)), _) => Request::After(t, options),
            (Some(crate::data::Pivot::Before(t)), _) => Request::Before(t, options),
            (None, Selection::Earliest) => Request::Earliest(options),
            (None, Selection::Latest) => Request::Latest(options),
        }
    }
}

impl FromStr for Request {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Request::parse(s)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

/// A server frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Successful reply with a body.
    Ok(String),
    /// Failure with a one-line message.
    Err(String),
    /// Reading pushed to a subscriber, as JSON.
    Data(String),
}

impl Response {
    /// Failure response for an error.
    pub fn error(err: &DaqError) -> Self {
        Response::Err(err.to_string())
    }

    /// Wire form of the frame.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Response::Ok(body) => framed("OK", body),
            Response::Err(message) => {
                let single_line = message.replace(['\r', '\n'], " ");
                format!("ERR {}\n", single_line).into_bytes()
            }
            Response::Data(body) => framed("DATA", body),
        }
    }

    /// The body of an `OK` frame; `ERR` becomes [`DaqError::Remote`].
    pub fn into_body(self) -> AppResult<String> {
        match self {
            Response::Ok(body) => Ok(body),
            Response::Err(message) => Err(DaqError::Remote(message)),
            Response::Data(_) => Err(DaqError::Protocol(
                "pushed reading received in reply to a request".to_string(),
            )),
        }
    }
}

fn framed(tag: &str, body: &str) -> Vec<u8> {
    let mut frame = format!("{} {}\n", tag, body.len()).into_bytes();
    frame.extend_from_slice(body.as_bytes());
    frame.push(b'\n');
    frame
}

/// Writes one frame.
pub async fn write_response<W>(writer: &mut W, response: &Response) -> AppResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&response.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Writes one request line.
pub async fn write_line<W>(writer: &mut W, line: &str) -> AppResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one line of at most [`MAX_LINE_LEN`] bytes, without its terminator.
///
/// Returns `None` at end of stream.
pub async fn read_line<R>(reader: &mut R) -> AppResult<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    read_line_into(reader, &mut Vec::new()).await
}

/// Like [`read_line`], but keeps partial input in `buf` between calls.
///
/// Cancel safe: if the future is dropped mid-line, the bytes consumed so far
/// stay in `buf` and the next call continues the same line.
pub async fn read_line_into<R>(reader: &mut R, buf: &mut Vec<u8>) -> AppResult<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let remaining = (MAX_LINE_LEN + 1).saturating_sub(buf.len()) as u64;
    let read = reader.take(remaining).read_until(b'\n', buf).await?;
    if read == 0 && buf.is_empty() {
        return Ok(None);
    }
    let line = std::mem::take(buf);
    if line.last() != Some(&b'\n') && line.len() > MAX_LINE_LEN {
        return Err(DaqError::Protocol(format!(
            "line longer than {} bytes",
            MAX_LINE_LEN
        )));
    }
    let line = String::from_utf8(line)
        .map_err(|_| DaqError::Protocol("line is not valid UTF-8".to_string()))?;
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// Reads one frame. Returns `None` if the stream ends before a frame starts.
pub async fn read_response<R>(reader: &mut R) -> AppResult<Option<Response>>
where
    R: AsyncBufRead + Unpin,
{
    let Some(header) = read_line(reader).await? else {
        return Ok(None);
    };

    let (tag, rest) = header.split_once(' ').unwrap_or((header.as_str(), ""));
    match tag {
        "ERR" => Ok(Some(Response::Err(rest.to_string()))),
        "OK" | "DATA" => {
            let len: usize = rest
                .trim()
                .parse()
                .map_err(|_| DaqError::Protocol(format!("bad frame header '{}'", header)))?;
            if len > MAX_BODY_LEN {
                return Err(DaqError::Protocol(format!("frame of {} bytes is too large", len)));
            }
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).await?;
            let mut terminator = [0u8; 1];
            reader.read_exact(&mut terminator).await?;
            if terminator[0] != b'\n' {
                return Err(DaqError::Protocol("frame body not terminated".to_string()));
            }
            let body = String::from_utf8(body)
                .map_err(|_| DaqError::Protocol("frame body is not valid UTF-8".to_string()))?;
            Ok(Some(if tag == "OK" {
                Response::Ok(body)
            } else {
                Response::Data(body)
            }))
        }
        _ => Err(DaqError::Protocol(format!("bad frame header '{}'", header))),
    }
}

/// Server information returned by `info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Crate version of the server.
    pub server_version: String,
    /// When the server started, ms since epoch.
    pub start_time: i64,
    /// Seconds since the server started.
    pub up_time: i64,
    /// Readings currently held.
    pub readings: usize,
    /// Connected clients.
    pub clients: usize,
}

impl ServerInfo {
    /// `key,value` lines.
    pub fn to_csv(&self) -> String {
        format!(
            "server_version,{}\nstart_time,{}\nup_time,{}\nreadings,{}\nclients,{}",
            self.server_version, self.start_time, self.up_time, self.readings, self.clients
        )
    }
}

/// `1,2,3`
pub fn join_channels(channels: &[u8]) -> String {
    channels
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Parses `1,2,3`.
pub fn parse_channels(value: &str) -> AppResult<Vec<u8>> {
    value
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| parse_number(s.trim(), "channel"))
        .collect()
}

fn required<'a>(token: Option<&'a str>, what: &str) -> AppResult<&'a str> {
    token.ok_or_else(|| DaqError::Protocol(format!("missing {}", what)))
}

fn parse_number<T: FromStr>(value: &str, what: &str) -> AppResult<T> {
    value
        .parse()
        .map_err(|_| DaqError::Protocol(format!("invalid {} '{}'", what, value)))
}
