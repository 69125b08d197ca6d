use chunkdock_protocol::UploadRecord;

use crate::TransferError;
use crate::validation::MAX_FILE_NAME_LEN;

/// Upload parameters a client repeats with every admission and save.
///
/// The first admission freezes them into the record; any later request
/// declaring different values is rejected as a flow change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub file_name: String,
    pub total_chunks: u32,
    pub total_size: u64,
}

impl Declaration {
    pub fn new(file_name: impl Into<String>, total_chunks: u32, total_size: u64) -> Self {
        Self {
            file_name: file_name.into(),
            total_chunks,
            total_size,
        }
    }

    /// Checks the size limit first, then the shape of the declaration.
    ///
    /// Every chunk of a non-empty upload carries at least one byte, so the
    /// chunk count may not exceed the total size (or 1 for an empty file).
    pub fn validate(&self, max_upload_size: u64, max_total_chunks: u32) -> Result<(), TransferError> {
        if self.total_size > max_upload_size {
            return Err(TransferError::TooLarge {
                declared: self.total_size,
                max: max_upload_size,
            });
        }
        if self.file_name.is_empty() {
            return Err(TransferError::InvalidDeclaration("empty file name".into()));
        }
        if self.file_name.len() > MAX_FILE_NAME_LEN {
            return Err(TransferError::InvalidDeclaration(format!(
                "file name longer than {MAX_FILE_NAME_LEN} bytes"
            )));
        }
        if self.total_chunks == 0 {
            return Err(TransferError::InvalidDeclaration(
                "total chunks must be at least 1".into(),
            ));
        }
        if self.total_chunks > max_total_chunks {
            return Err(TransferError::InvalidDeclaration(format!(
                "{} chunks exceed the limit of {max_total_chunks}",
                self.total_chunks
            )));
        }
        if u64::from(self.total_chunks) > self.total_size.max(1) {
            return Err(TransferError::InvalidDeclaration(format!(
                "{} chunks cannot carry {} bytes",
                self.total_chunks, self.total_size
            )));
        }
        Ok(())
    }

    /// Fails with [`TransferError::FlowChanged`] naming the first field
    /// that differs from `record`.
    pub fn ensure_unchanged(&self, record: &UploadRecord) -> Result<(), TransferError> {
        let field = if self.file_name != record.original_name {
            "fileName"
        } else if self.total_chunks != record.total_chunks {
            "totalChunks"
        } else if self.total_size != record.total_size {
            "totalSize"
        } else {
            return Ok(());
        };
        Err(TransferError::FlowChanged {
            upload_id: record.id.clone(),
            field,
        })
    }
}

/// Result of an admission test for one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The chunk is missing; the client should transfer it.
    Ready,
    /// The chunk is already stored; the client should skip it.
    AlreadyPresent,
}

impl Admission {
    pub fn is_already_present(self) -> bool {
        self == Self::AlreadyPresent
    }
}
