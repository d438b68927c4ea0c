//! Simulated unit → retriever → store → server → client over loopback.

use datalog::adc::hrdl::constants::{Channel, ConversionTime};
use datalog::adc::hrdl::SimulatedDriver;
use datalog::adc::{Adc, PicoLogAdc24};
use datalog::clock::{Clock, ManualClock};
use datalog::config::{ChannelConfig, DeviceConfig, ServerConfig};
use datalog::data::{DataStore, ReadingQuery};
use datalog::error::DaqError;
use datalog::fetch::{Retriever, RetrieverHandle};
use datalog::network::{DataClient, DataServer};
use datalog::network::protocol::{read_response, MAX_LINE_LEN};
use datalog::network::Response;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const START: i64 = 1_600_000_000_000;
const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    clock: ManualClock,
    retriever: RetrieverHandle,
    addr: SocketAddr,
    stop_server: oneshot::Sender<()>,
    server: JoinHandle<datalog::error::AppResult<()>>,
}

impl Harness {
    async fn start(max_connections: usize) -> Self {
        Self::start_with(ServerConfig {
            max_connections,
            ..ServerConfig::default()
        })
        .await
    }

    async fn start_with(server: ServerConfig) -> Self {
        let clock = ManualClock::new(START);
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let adc: Box<dyn Adc> = Box::new(PicoLogAdc24::new(
            SimulatedDriver::with_seed(shared.clone(), 11),
            shared,
        ));

        let device = DeviceConfig {
            sample_time_ms: 1000,
            conversion_time: ConversionTime::Time60ms,
            channels: [1, 2]
                .iter()
                .map(|&n| ChannelConfig::new(Channel::new(n).unwrap()))
                .collect(),
            ..DeviceConfig::default()
        };

        let store = DataStore::new(100).into_shared();
        let retriever = Retriever::new(adc, store.clone(), Duration::from_millis(10))
            .with_device(device)
            .spawn()
            .unwrap();

        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..server
        };
        let server = DataServer::bind(config, store, retriever.status())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_server, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(server.run_until(async {
            let _ = stop_rx.await;
        }));

        Self {
            clock,
            retriever,
            addr,
            stop_server,
            server,
        }
    }

    async fn advance_and_wait(&self, millis: i64, stored: u64) {
        self.clock.advance(millis);
        let mut status = self.retriever.status();
        timeout(WAIT, status.wait_for(|s| s.readings_stored >= stored))
            .await
            .unwrap()
            .unwrap();
    }

    async fn shutdown(self) {
        self.retriever.stop().await.unwrap();
        self.stop_server.send(()).unwrap();
        self.server.await.unwrap().unwrap();
    }
}

async fn raw_connect(addr: SocketAddr) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
    let stream = TcpStream::connect(addr).await.unwrap();
    stream.set_nodelay(true).unwrap();
    let (read_half, write_half) = stream.into_split();
    (BufReader::new(read_half), write_half)
}

async fn next_frame(reader: &mut BufReader<OwnedReadHalf>) -> Option<Response> {
    timeout(WAIT, read_response(reader)).await.unwrap().unwrap()
}

fn times(readings: &[datalog::data::Reading]) -> Vec<i64> {
    readings.iter().map(|r| r.reading_time()).collect()
}

#[tokio::test]
async fn test_client_reads_unit_status() {
    let harness = Harness::start(5).await;
    let mut client = DataClient::connect(harness.addr).await.unwrap();

    assert_eq!(client.enabled_channels().await.unwrap(), vec![1, 2]);
    assert_eq!(client.sample_time().await.unwrap(), 1000);
    assert_eq!(client.stream_start_timestamp().await.unwrap(), START);

    let factor = client.volts_conversion(1).await.unwrap();
    assert_eq!(factor, 2.5 / 16_777_215.0);

    let err = client.volts_conversion(9).await.unwrap_err();
    assert!(matches!(err, DaqError::Remote(msg) if msg.contains("channel 9")));

    client.quit().await.unwrap();
    harness.shutdown().await;
}

#[tokio::test]
async fn test_client_queries_stored_readings() {
    let harness = Harness::start(5).await;
    harness.advance_and_wait(5_000, 5).await;

    let mut client = DataClient::connect(harness.addr).await.unwrap();

    let all = client.readings(&ReadingQuery::new()).await.unwrap();
    assert_eq!(
        times(&all),
        vec![START, START + 1000, START + 2000, START + 3000, START + 4000]
    );
    assert!(all.iter().all(|r| r.channels() == vec![1, 2]));

    let latest = client
        .readings(&ReadingQuery::new().latest().amount(2))
        .await
        .unwrap();
    assert_eq!(times(&latest), vec![START + 3000, START + 4000]);

    let before = client
        .readings(&ReadingQuery::new().before(START + 1000))
        .await
        .unwrap();
    assert_eq!(times(&before), vec![START, START + 1000]);

    let csv = client
        .readings_csv(&ReadingQuery::new().after(START + 2000).channels(vec![2]))
        .await
        .unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with(&format!("{},", START + 3000)));
    assert_eq!(lines[0].split(',').count(), 2);

    let info = client.info().await.unwrap();
    assert_eq!(info.readings, 5);
    assert_eq!(info.clients, 1);
    assert_eq!(info.server_version, env!("CARGO_PKG_VERSION"));

    client.quit().await.unwrap();
    harness.shutdown().await;
}

#[tokio::test]
async fn test_subscription_and_polling_streams() {
    let harness = Harness::start(5).await;
    harness.advance_and_wait(3_000, 3).await;

    let subscriber = DataClient::connect(harness.addr).await.unwrap();
    let pushed = subscriber.subscribe(Some(vec![1])).await.unwrap();
    tokio::pin!(pushed);

    harness.advance_and_wait(1_000, 4).await;
    let reading = timeout(WAIT, pushed.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(reading.reading_time(), START + 3000);
    assert_eq!(reading.channels(), vec![1]);

    let poller = DataClient::connect(harness.addr).await.unwrap();
    let polled = poller.poll_stream(START + 1000, Duration::from_millis(10));
    let polled: Vec<_> = timeout(WAIT, polled.take(2).collect::<Vec<_>>())
        .await
        .unwrap();
    let polled: Vec<i64> = polled
        .into_iter()
        .map(|r| r.unwrap().reading_time())
        .collect();
    assert_eq!(polled, vec![START + 2000, START + 3000]);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_malformed_requests_keep_connection_open() {
    let harness = Harness::start(5).await;
    let mut client = DataClient::connect(harness.addr).await.unwrap();

    let response = client
        .request(&"after 5 amount=3".parse().unwrap())
        .await
        .unwrap();
    assert!(matches!(response, Response::Ok(_)));

    // The typed helpers cannot send garbage, so go through the raw socket
    let (mut reader, mut writer) = raw_connect(harness.addr).await;
    writer.write_all(b"launch rockets\ntimestamp\n").await.unwrap();

    let first = next_frame(&mut reader).await.unwrap();
    assert!(matches!(first, Response::Err(msg) if msg.contains("unknown command")));
    let second = next_frame(&mut reader).await.unwrap();
    assert!(matches!(second, Response::Ok(body) if body.parse::<i64>().is_ok()));

    client.quit().await.unwrap();
    harness.shutdown().await;
}

#[tokio::test]
async fn test_oversized_request_closes_connection() {
    let harness = Harness::start(5).await;
    let (mut reader, mut writer) = raw_connect(harness.addr).await;

    writer.write_all(&vec![b'a'; MAX_LINE_LEN + 50]).await.unwrap();
    let refused = next_frame(&mut reader).await.unwrap();
    assert!(matches!(refused, Response::Err(msg) if msg.contains("longer than")));

    let after = timeout(WAIT, read_response(&mut reader)).await.unwrap();
    assert!(!matches!(after, Ok(Some(_))));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_idle_client_is_disconnected() {
    let harness = Harness::start_with(ServerConfig {
        read_timeout_secs: 1,
        ..ServerConfig::default()
    })
    .await;
    let (mut reader, mut writer) = raw_connect(harness.addr).await;

    writer.write_all(b"timestamp\n").await.unwrap();
    assert!(matches!(next_frame(&mut reader).await, Some(Response::Ok(_))));

    // Nothing more is sent; the server hangs up after the read timeout
    assert!(next_frame(&mut reader).await.is_none());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_quit_split_across_writes_ends_subscription() {
    let harness = Harness::start(5).await;
    let (mut reader, mut writer) = raw_connect(harness.addr).await;

    writer.write_all(b"subscribe\n").await.unwrap();
    assert_eq!(
        next_frame(&mut reader).await,
        Some(Response::Ok("subscribed".to_string()))
    );

    writer.write_all(b"qu").await.unwrap();
    harness.advance_and_wait(1_000, 1).await;
    assert!(matches!(next_frame(&mut reader).await, Some(Response::Data(_))));

    writer.write_all(b"it\n").await.unwrap();
    assert_eq!(
        next_frame(&mut reader).await,
        Some(Response::Ok("bye".to_string()))
    );
    assert!(next_frame(&mut reader).await.is_none());

    harness.shutdown().await;
}
