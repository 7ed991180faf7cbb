//! WebSocket transport for the sync core.
//!
//! Architecture:
//! ```text
//!                 ws://host/?session=<uuid>
//! Client ──────────────────────────────────────► handshake ── resolve/create Session
//!                                                   │        (id echoed in x-logos-session)
//!                                                   ▼
//!                        ┌──────────── per-connection task ────────────┐
//!   binary frame ──────► │ Registry::handle_frame                      │
//!                        │ outbound channel ◄── Session sends ─────────┼──► binary frame
//!                        │ heartbeat ping                              │
//!                        └─────────────────────────────────────────────┘
//! ```
//!
//! Reconnecting with the id from `x-logos-session` resumes the same session,
//! with its confirmation counters intact. An unknown id gets a fresh session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::connection::{ChannelConnection, Connection};
use crate::error::SyncError;
use crate::persistence::PersistenceConfig;
use crate::registry::Registry;
use crate::session::{Session, SessionId};

/// Response header carrying the session id.
pub const SESSION_HEADER: &str = "x-logos-session";
/// Query parameter naming the session to resume.
pub const SESSION_QUERY_PARAM: &str = "session";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before sends are dropped
    pub outbound_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Largest accepted WebSocket message
    pub max_message_size: usize,
    pub persistence: PersistenceConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8899".to_string(),
            outbound_capacity: 64,
            heartbeat_interval_secs: 54,
            max_message_size: 16 << 20,
            persistence: PersistenceConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Ephemeral port and test persistence rooted at `dir`.
    pub fn for_testing(dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            outbound_capacity: 256,
            heartbeat_interval_secs: 30,
            persistence: PersistenceConfig::for_testing(dir),
            ..Self::default()
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    /// Frames rejected by the decoder or the core
    pub rejected_frames: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<Registry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening storage and starting persistence.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: ServerConfig) -> Result<Self, SyncError> {
        let registry = Arc::new(Registry::new(config.persistence.clone())?);
        Ok(Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// Bind the configured address and serve until an accept error.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<Registry>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let mut resolved: Option<Arc<Session>> = None;
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(config.max_message_size))
            .max_frame_size(Some(config.max_message_size));
        let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            |request: &Request, response: Response| {
                resolve_session(&registry, request, response, &mut resolved)
            },
            Some(ws_config),
        )
        .await?;
        let session = resolved.ok_or("handshake finished without a session")?;

        let (conn, outbound) = ChannelConnection::new(config.outbound_capacity);
        registry.attach_connection(&session, conn.clone()).await;
        log::info!("Session {} connected from {addr} as {}", session.id(), conn.id());

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = Self::pump(ws_stream, &registry, &session, outbound, &stats, &config).await;

        conn.close();
        conn.mark_closed();
        let removed = registry.detach_connection(&session, conn.id()).await;
        stats.write().await.active_connections -= 1;
        log::info!(
            "Session {} disconnected from {addr}{}",
            session.id(),
            if removed { ", session removed" } else { "" }
        );
        result
    }

    /// Move frames between the socket and the core until either side closes.
    async fn pump(
        ws_stream: WebSocketStream<TcpStream>,
        registry: &Registry,
        session: &Arc<Session>,
        mut outbound: mpsc::Receiver<Vec<u8>>,
        stats: &RwLock<ServerStats>,
        config: &ServerConfig,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let period = Duration::from_secs(config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            if let Err(e) = registry.handle_frame(session, &data).await {
                                stats.write().await.rejected_frames += 1;
                                if e.is_fatal() {
                                    log::error!("Session {}: {e}", session.id());
                                    break;
                                }
                                log::warn!("Session {}: frame rejected: {e}", session.id());
                            }
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => break,

                        Some(Err(e)) => {
                            log::error!("WebSocket error on session {}: {e}", session.id());
                            break;
                        }

                        _ => {}
                    }
                }

                frame = outbound.recv() => {
                    match frame {
                        Some(frame) => ws_sender.send(Message::Binary(frame.into())).await?,
                        None => break,
                    }
                }

                _ = heartbeat.tick() => {
                    if session.is_aborted() {
                        break;
                    }
                    ws_sender.send(Message::Ping(Default::default())).await?;
                }
            }
        }

        let _ = ws_sender.close().await;
        Ok(())
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

/// Session id requested in the handshake query, if any.
fn requested_session(query: Option<&str>) -> Option<Result<SessionId, uuid::Error>> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == SESSION_QUERY_PARAM)
        .map(|(_, value)| value.parse())
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Handshake callback: resume or create the session and echo its id.
fn resolve_session(
    registry: &Registry,
    request: &Request,
    mut response: Response,
    resolved: &mut Option<Arc<Session>>,
) -> Result<Response, ErrorResponse> {
    let existing = match requested_session(request.uri().query()) {
        Some(Ok(id)) => {
            let session = registry.get_session(id).filter(|s| !s.is_aborted());
            if session.is_none() {
                log::debug!("Unknown or aborted session {id} requested, creating a new one");
            }
            session
        }
        Some(Err(e)) => {
            log::warn!("Malformed session id in handshake: {e}");
            return Err(reject(StatusCode::BAD_REQUEST, "malformed session id"));
        }
        None => None,
    };

    let session = match existing {
        Some(session) => session,
        None => registry.create_session().map_err(|e| {
            log::error!("Session creation failed: {e}");
            reject(StatusCode::INTERNAL_SERVER_ERROR, "session creation failed")
        })?,
    };

    let header = HeaderValue::from_str(&session.id().to_string())
        .map_err(|_| reject(StatusCode::INTERNAL_SERVER_ERROR, "invalid session header"))?;
    response.headers_mut().insert(SESSION_HEADER, header);
    *resolved = Some(session);
    Ok(response)
}
