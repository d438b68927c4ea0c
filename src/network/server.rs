//! TCP server answering data requests from the shared store.
//!
//! Each accepted connection gets its own task and a [`Session`]. The number of
//! simultaneous clients is bounded by `max_connections`; a client arriving when
//! every slot is taken receives `ERR server busy` and is disconnected. Idle
//! clients are dropped after `read_timeout_secs` without a request, except
//! subscribers, which only listen.
//!
//! [`Session`]: super::session::Session

use super::protocol::{
    join_channels, read_line, read_line_into, write_response, DataFormat, QueryOptions, Request, Response,
    ServerInfo,
};
use super::session::SessionManager;
use crate::config::ServerConfig;
use crate::data::{ReadingQuery, SharedDataStore};
use crate::error::{AppResult, DaqError};
use crate::fetch::AdcStatus;
use chrono::Utc;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::time::{interval, timeout, Duration};
use tracing::{debug, error, info, info_span, warn, Instrument};

const CLEANUP_INTERVAL_SECS: u64 = 10;

/// State every connection task reads from.
struct ServerContext {
    store: SharedDataStore,
    status: watch::Receiver<AdcStatus>,
    config: ServerConfig,
    sessions: SessionManager,
    started_at: i64,
}

/// Listening data server.
pub struct DataServer {
    listener: TcpListener,
    context: Arc<ServerContext>,
    limiter: Arc<Semaphore>,
}

impl DataServer {
    /// Binds to `config.host:config.port`. Port 0 picks a free port.
    pub async fn bind(
        config: ServerConfig,
        store: SharedDataStore,
        status: watch::Receiver<AdcStatus>,
    ) -> AppResult<Self> {
        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address).await?;
        info!(address = %listener.local_addr()?, "Data server listening");

        let limiter = Arc::new(Semaphore::new(config.max_connections));
        Ok(Self {
            listener,
            limiter,
            context: Arc::new(ServerContext {
                store,
                status,
                config,
                sessions: SessionManager::new(),
                started_at: Utc::now().timestamp_millis(),
            }),
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Session registry, shared with the running server.
    pub fn sessions(&self) -> SessionManager {
        self.context.sessions.clone()
    }

    /// Serves clients until `shutdown` completes.
    ///
    /// Connections already accepted are left to finish on their own.
    pub async fn run_until<F>(self, shutdown: F) -> AppResult<()>
    where
        F: Future<Output = ()>,
    {
        let mut cleanup_interval = interval(Duration::from_secs(CLEANUP_INTERVAL_SECS));
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Data server shutting down");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => self.accept(socket, addr).await,
                        Err(e) => error!("Accept error: {}", e),
                    }
                }

                _ = cleanup_interval.tick() => {
                    let removed = self.context.sessions.cleanup_expired_sessions().await;
                    if removed > 0 {
                        debug!(removed, "Expired idle sessions");
                    }
                }
            }
        }
        Ok(())
    }

    async fn accept(&self, mut socket: TcpStream, addr: SocketAddr) {
        let permit = match self.limiter.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(%addr, "Rejecting client, server busy");
                let busy = Response::Err("server busy".to_string());
                if let Err(e) = write_response(&mut socket, &busy).await {
                    debug!(%addr, "Failed to send busy reply: {}", e);
                }
                return;
            }
        };

        let context = self.context.clone();
        tokio::spawn(
            async move {
                if let Err(e) = handle_client(socket, addr, context).await {
                    warn!("Client {} error: {}", addr, e);
                }
                drop(permit);
            }
            .instrument(info_span!("client", %addr)),
        );
    }
}

async fn handle_client(
    socket: TcpStream,
    addr: SocketAddr,
    context: Arc<ServerContext>,
) -> AppResult<()> {
    let read_timeout = Duration::from_secs(context.config.read_timeout_secs);
    let session = context
        .sessions
        .create_session(addr, context.config.read_timeout_secs)
        .await;
    info!(session = %session.id, "Client connected");

    let (read_half, mut writer) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    let result: AppResult<()> = async {
        loop {
            let line = match timeout(read_timeout, read_line(&mut reader)).await {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => {
                    info!("Client disconnected");
                    break Ok(());
                }
                Ok(Err(DaqError::Protocol(message))) => {
                    // Oversized or non-UTF-8 lines cannot be resynchronised
                    let _ = write_response(&mut writer, &Response::Err(message.clone())).await;
                    break Err(DaqError::Protocol(message));
                }
                Ok(Err(e)) => break Err(e),
                Err(_) => {
                    info!(session = %session.id, "Read timeout, closing session");
                    break Ok(());
                }
            };

            if line.trim().is_empty() {
                continue;
            }
            context.sessions.record_request(&session.id).await;

            let request = match Request::parse(&line) {
                Ok(request) => request,
                Err(e) => {
                    debug!(%line, "Bad request: {}", e);
                    write_response(&mut writer, &Response::error(&e)).await?;
                    continue;
                }
            };
            debug!(%request, "Request");

            match request {
                Request::Quit => {
                    write_response(&mut writer, &Response::Ok("bye".to_string())).await?;
                    break Ok(());
                }
                Request::Subscribe(channels) => {
                    context.sessions.mark_subscribed(&session.id).await;
                    let readings = context.store.read().await.subscribe();
                    write_response(&mut writer, &Response::Ok("subscribed".to_string())).await?;
                    break stream_readings(&mut reader, &mut writer, readings, channels).await;
                }
                request => {
                    let response = answer(&context, request).await;
                    write_response(&mut writer, &response).await?;
                }
            }
        }
    }
    .await;

    context.sessions.remove_session(&session.id).await;
    info!(session = %session.id, "Client session closed");
    result
}

/// Pushes every new reading to a subscribed client until it quits or leaves.
async fn stream_readings<R, W>(
    reader: &mut R,
    writer: &mut W,
    mut readings: broadcast::Receiver<crate::data::Reading>,
    channels: Option<Vec<u8>>,
) -> AppResult<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // Partial input survives a pushed reading winning the select
    let mut pending = Vec::new();
    loop {
        tokio::select! {
            received = readings.recv() => {
                let reading = match received {
                    Ok(reading) => reading,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Subscriber lagging, readings skipped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                };
                let reading = match &channels {
                    Some(channels) => match reading.project(channels) {
                        Some(projected) => projected,
                        None => continue,
                    },
                    None => reading,
                };
                write_response(writer, &Response::Data(reading.to_json()?)).await?;
            }

            line = read_line_into(reader, &mut pending) => {
                match line? {
                    None => return Ok(()),
                    Some(line) => match Request::parse(&line) {
                        Ok(Request::Quit) => {
                            write_response(writer, &Response::Ok("bye".to_string())).await?;
                            return Ok(());
                        }
                        _ => {
                            let refused = "only quit is accepted while subscribed";
                            write_response(writer, &Response::Err(refused.to_string())).await?;
                        }
                    },
                }
            }
        }
    }
}

async fn answer(context: &ServerContext, request: Request) -> Response {
    match respond(context, request).await {
        Ok(body) => Response::Ok(body),
        Err(e) => Response::error(&e),
    }
}

async fn respond(context: &ServerContext, request: Request) -> AppResult<String> {
    let status = context.status.borrow().clone();
    match request {
        Request::Timestamp => Ok(Utc::now().timestamp_millis().to_string()),
        Request::SampleTime => status
            .sample_time_ms
            .map(|t| t.to_string())
            .ok_or_else(|| DaqError::Device("sample time is not set".to_string())),
        Request::StreamStartTimestamp => status
            .stream_start_timestamp
            .map(|t| t.to_string())
            .ok_or_else(|| DaqError::Device("unit is not streaming".to_string())),
        Request::EnabledChannels => Ok(join_channels(&status.enabled_channels)),
        Request::VoltsConversion(channel) => status
            .volts_conversions
            .get(&channel)
            .map(|factor| factor.to_string())
            .ok_or_else(|| DaqError::Device(format!("channel {} is not enabled", channel))),
        Request::Info(format) => {
            let readings = context.store.read().await.len();
            let clients = context.sessions.count().await;
            let info = ServerInfo {
                server_version: env!("CARGO_PKG_VERSION").to_string(),
                start_time: context.started_at,
                up_time: (Utc::now().timestamp_millis() - context.started_at) / 1000,
                readings,
                clients,
            };
            match format.unwrap_or(context.config.default_format) {
                DataFormat::Json => Ok(serde_json::to_string(&info)?),
                DataFormat::Csv => Ok(info.to_csv()),
            }
        }
        Request::Earliest(options) => {
            let query = build_query(context, &options).earliest();
            render(context, &query, options.format).await
        }
        Request::Latest(options) => {
            let query = build_query(context, &options).latest();
            render(context, &query, options.format).await
        }
        Request::Before(time, options) => {
            let query = build_query(context, &options).before(time);
            render(context, &query, options.format).await
        }
        Request::After(time, options) => {
            let query = build_query(context, &options).after(time);
            render(context, &query, options.format).await
        }
        Request::DataAfter(time) => {
            let query = build_query(context, &QueryOptions::default()).after(time);
            render(context, &query, Some(DataFormat::Csv)).await
        }
        Request::Subscribe(_) | Request::Quit => Err(DaqError::Protocol(
            "connection command handled by the session".to_string(),
        )),
    }
}

fn build_query(context: &ServerContext, options: &QueryOptions) -> ReadingQuery {
    options.to_query(
        context.config.default_readings_per_request,
        context.config.max_readings_per_request,
    )
}

async fn render(
    context: &ServerContext,
    query: &ReadingQuery,
    format: Option<DataFormat>,
) -> AppResult<String> {
    let store = context.store.read().await;
    match format.unwrap_or(context.config.default_format) {
        DataFormat::Json => store.to_json(query),
        DataFormat::Csv => Ok(store.to_csv(query)),
    }
}
