//! Upload WebSocket server.
//!
//! Listens on a TCP port, upgrades incoming connections to WebSocket, and
//! serves up to `max_connections` clients at once.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::accept_async_with_config;
use tokio_util::sync::CancellationToken;

use chunkdock_protocol::constants::WS_MAX_MESSAGE_SIZE;

use crate::connection::{self, ClientConnection, ClientMeta};
use crate::handler::Handler;
use crate::{DEFAULT_MAX_CONNECTIONS, ServerError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// Connections beyond this many are refused before the handshake.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// The upload WebSocket server.
///
/// Every client gets its own read/write pumps; messages are dispatched to
/// the shared [`Handler`].
pub struct UploadServer<H: Handler> {
    config: ServerConfig,
    handler: Arc<H>,
    clients: Mutex<HashMap<String, ClientConnection>>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<H: Handler> UploadServer<H> {
    /// Creates a new server with the given handler.
    pub fn new(config: ServerConfig, handler: H) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler: Arc::new(handler),
            clients: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// Returns the handler shared by all connections.
    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Returns the number of live client connections.
    pub async fn client_count(&self) -> usize {
        let mut clients = self.clients.lock().await;
        clients.retain(|_, c| c.is_alive());
        clients.len()
    }

    /// Closes every client connection and waits for their cleanup hooks.
    pub async fn disconnect_all(&self) {
        let drained: Vec<_> = self.clients.lock().await.drain().map(|(_, c)| c).collect();
        for conn in drained {
            conn.close_and_wait().await;
        }
    }

    /// Gracefully shuts down the server.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until cancellation.
    ///
    /// Binds to the configured port and accepts WebSocket connections.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.config.port).into();
        let listener = TcpListener::bind(addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!(
            max_connections = self.config.max_connections,
            "upload server listening on {local_addr}"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    self.disconnect_all().await;
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::warn!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Handles a single TCP connection: checks capacity, upgrades to WS
    /// and registers the client.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        if self.client_count().await >= self.config.max_connections {
            tracing::warn!(%peer_addr, "rejecting connection: limit reached");
            return Err(ServerError::TooManyConnections(self.config.max_connections));
        }

        // WebSocket upgrade with size limits matching our protocol constants.
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;

        let meta = ClientMeta {
            client_id: uuid::Uuid::new_v4().to_string(),
            remote_addr: peer_addr.to_string(),
        };
        tracing::info!(%peer_addr, client = %meta.client_id, "WebSocket connection established");

        let mut clients = self.clients.lock().await;
        // Double-check: other handshakes may have completed meanwhile.
        clients.retain(|_, c| c.is_alive());
        if clients.len() >= self.config.max_connections {
            drop(ws_stream);
            return Err(ServerError::TooManyConnections(self.config.max_connections));
        }

        self.handler.on_client_connected(&meta).await;
        let conn = connection::spawn_connection(
            ws_stream,
            meta.clone(),
            Arc::clone(&self.handler),
            self.cancel.clone(),
        );
        clients.insert(meta.client_id, conn);

        Ok(())
    }
}
