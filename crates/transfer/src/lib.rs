//! Chunked upload coordination.
//!
//! A client allocates an identifier, asks for admission before each chunk,
//! then saves the chunk. The [`Coordinator`] stages chunk payloads on disk,
//! tracks presence in an [`UploadRecord`](chunkdock_protocol::UploadRecord)
//! held by a [`RecordStore`], and merges the chunks into the final artifact
//! exactly once when the last one lands.
//!
//! Everything here is synchronous; async callers should run operations on
//! a blocking thread.

mod allocator;
mod chunked;
mod config;
mod coordinator;
mod locks;
mod merge;
mod repository;
mod types;
mod validation;

pub use allocator::{IdGenerator, IdentifierAllocator};
pub use chunked::{ChunkStore, calculate_file_checksum, checksum_bytes};
pub use config::{
    DEFAULT_MAX_ALLOCATION_ATTEMPTS, DEFAULT_MAX_TOTAL_CHUNKS, DEFAULT_MAX_UPLOAD_SIZE, MergePolicy,
    StorageConfig,
};
pub use coordinator::Coordinator;
pub use locks::KeyedLocks;
pub use merge::{MergeOutcome, Merger};
pub use repository::{FileRecordStore, MemoryRecordStore, RecordStore};
pub use types::{Admission, Declaration};
pub use validation::{MAX_FILE_NAME_LEN, MAX_IDENTIFIER_LEN, check_chunk_index, validate_identifier};

/// Coarse classification of a [`TransferError`].
///
/// Boundaries use this to decide between client-error and server-error
/// responses and whether a retry makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or inconsistent request. Never retried.
    Protocol,
    /// Declared size exceeds the configured maximum.
    TooLarge,
    /// No record exists for the identifier.
    NotFound,
    /// The identifier is already taken by an on-disk artifact or record.
    Collision,
    /// I/O or storage failure; the same request may succeed later.
    Transient,
    /// Chunks were all received but the merge did not produce an artifact.
    Merge,
}

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("invalid declaration: {0}")]
    InvalidDeclaration(String),

    #[error("chunk {chunk} out of range 1..={total_chunks}")]
    InvalidChunkIndex { chunk: u32, total_chunks: u32 },

    #[error("declared size {declared} exceeds maximum {max}")]
    TooLarge { declared: u64, max: u64 },

    #[error("upload not found: {0}")]
    UploadNotFound(String),

    #[error("identifier collision: {0} already exists on disk")]
    IdentifierCollision(String),

    #[error("record already exists: {0}")]
    RecordExists(String),

    #[error("flow changed for {upload_id}: {field} differs from the stored record")]
    FlowChanged {
        upload_id: String,
        field: &'static str,
    },

    #[error("checksum mismatch for chunk {chunk}")]
    ChecksumMismatch { chunk: u32 },

    #[error("chunk {chunk} of {upload_id} was already stored with a different checksum")]
    ChunkConflict { upload_id: String, chunk: u32 },

    #[error("no free identifier after {0} attempts")]
    AllocationExhausted(u32),

    #[error("merge failed for {upload_id} at chunk {chunk}: {reason}")]
    MergeFailed {
        upload_id: String,
        chunk: u32,
        reason: String,
    },
}

impl TransferError {
    /// Returns the error's class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) | Self::Encoding(_) | Self::ChecksumMismatch { .. } => {
                ErrorKind::Transient
            }
            Self::AllocationExhausted(_) => ErrorKind::Transient,
            Self::InvalidIdentifier(_)
            | Self::InvalidDeclaration(_)
            | Self::InvalidChunkIndex { .. }
            | Self::FlowChanged { .. }
            | Self::ChunkConflict { .. } => ErrorKind::Protocol,
            Self::TooLarge { .. } => ErrorKind::TooLarge,
            Self::UploadNotFound(_) => ErrorKind::NotFound,
            Self::IdentifierCollision(_) | Self::RecordExists(_) => ErrorKind::Collision,
            Self::MergeFailed { .. } => ErrorKind::Merge,
        }
    }

    /// Returns `true` if resending the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}
