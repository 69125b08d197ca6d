use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time to wait for a pong response (or any incoming message).
///
/// Acts as a read deadline: a client that sends nothing at all within
/// this window is considered gone. Kept generous because a single chunk
/// save may block on disk I/O, and a completing chunk also runs the merge.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often the server pings each client.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// Maximum message size in bytes (50 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// WebSocket message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Requests from client to daemon
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "allocate_identifier")]
    AllocateIdentifier,
    #[serde(rename = "admit_chunk")]
    AdmitChunk,
    #[serde(rename = "save_chunk")]
    SaveChunk,
    #[serde(rename = "get_record")]
    GetRecord,

    // Responses from daemon to client
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "identifier_response")]
    IdentifierResponse,
    #[serde(rename = "admit_response")]
    AdmitResponse,
    #[serde(rename = "chunk_saved")]
    ChunkSaved,
    #[serde(rename = "record_response")]
    RecordResponse,
    #[serde(rename = "error")]
    Error,

    // Events from daemon to client (push notifications)
    #[serde(rename = "upload_progress")]
    UploadProgress,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

/// Common WebSocket error codes.
pub const WS_ERR_CODE_BAD_REQUEST: i32 = 400;
pub const WS_ERR_CODE_NOT_FOUND: i32 = 404;
pub const WS_ERR_CODE_CONFLICT: i32 = 409;
pub const WS_ERR_CODE_TOO_LARGE: i32 = 413;
pub const WS_ERR_CODE_UNPROCESSABLE: i32 = 422;
pub const WS_ERR_CODE_INTERNAL: i32 = 500;
pub const WS_ERR_CODE_NOT_IMPLEMENTED: i32 = 501;
