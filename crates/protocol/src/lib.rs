//! Wire protocol shared by upload clients and the upload daemon.
//!
//! JSON envelopes carry signalling (identifier allocation, admission,
//! record lookups); chunk payloads travel either base64-encoded inside
//! a `save_chunk` envelope or as binary frames handled by the server.

pub mod constants;
pub mod envelope;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use constants::MessageType;
pub use envelope::{Message, WsError};
pub use types::{MergeStatus, UploadRecord};
