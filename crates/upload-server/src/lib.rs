//! WebSocket server for the upload daemon.
//!
//! Accepts many concurrent client connections, dispatches JSON and binary
//! messages to a [`Handler`] trait, and manages each connection's
//! lifecycle (ping/pong, graceful shutdown). Upload semantics live entirely
//! in the handler.

mod binary;
mod connection;
mod handler;
mod server;

pub use binary::{BinaryChunkHeader, ParseError, encode_binary_message, parse_binary_message};
pub use connection::{ClientConnection, ClientMeta, SendError, Sender};
pub use handler::{Handler, HandlerFuture};
pub use server::{ServerConfig, UploadServer};

/// Send buffer capacity per client.
///
/// Every saved chunk produces a reply plus a progress event, so the buffer
/// must absorb bursts from a client that is slow to read.
pub const SEND_BUFFER_SIZE: usize = 2048;

/// Default cap on simultaneously connected clients.
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Errors produced by the upload server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("too many connections (limit {0})")]
    TooManyConnections(usize),
}
