use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::TransferError;

/// Suffix of the per-upload staging directory, next to the artifact.
const STAGING_SUFFIX: &str = ".chunk";

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
///
/// The file is streamed, so multi-gigabyte artifacts are never held in memory.
pub fn calculate_file_checksum(path: &Path) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// ChunkStore
// ---------------------------------------------------------------------------

/// Durable chunk staging addressed by upload id and 1-based chunk number.
///
/// Layout under `base_path`:
///
/// ```text
/// <id>            final artifact
/// <id>.chunk/1    staged chunk 1
/// <id>.chunk/2    staged chunk 2
/// ```
///
/// Identifiers must already be validated; they are joined onto the base
/// path as-is.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    base_path: PathBuf,
}

impl ChunkStore {
    /// Creates a store rooted at `base_path`.
    pub fn new(base_path: &Path) -> Self {
        Self {
            base_path: base_path.to_path_buf(),
        }
    }

    /// Returns the base storage path.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn artifact_path(&self, id: &str) -> PathBuf {
        self.base_path.join(id)
    }

    pub fn staging_dir(&self, id: &str) -> PathBuf {
        self.base_path.join(format!("{id}{STAGING_SUFFIX}"))
    }

    pub fn chunk_path(&self, id: &str, chunk: u32) -> PathBuf {
        self.staging_dir(id).join(chunk.to_string())
    }

    /// Returns `true` if a final artifact exists for `id`.
    pub fn artifact_exists(&self, id: &str) -> bool {
        self.artifact_path(id).exists()
    }

    /// Returns `true` if a staging directory exists for `id`.
    pub fn chunk_directory_exists(&self, id: &str) -> bool {
        self.staging_dir(id).is_dir()
    }

    /// Returns `true` if either the artifact or the staging directory exists.
    pub fn has_trace(&self, id: &str) -> bool {
        self.artifact_exists(id) || self.chunk_directory_exists(id)
    }

    /// Creates the staging directory for `id` (and the base path).
    pub fn create_chunk_directory(&self, id: &str) -> Result<(), TransferError> {
        std::fs::create_dir_all(self.staging_dir(id))?;
        Ok(())
    }

    /// Appends `data` to the staging file of `chunk`.
    ///
    /// On failure the partially written file is removed so that a retry
    /// starts from an empty file.
    pub fn write_chunk(&self, id: &str, chunk: u32, data: &[u8]) -> Result<(), TransferError> {
        let path = self.chunk_path(id, chunk);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| {
                file.write_all(data)?;
                file.sync_data()
            });

        if let Err(e) = result {
            match std::fs::remove_file(&path) {
                Err(cleanup) if cleanup.kind() != ErrorKind::NotFound => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %cleanup,
                        "failed to remove partial chunk"
                    );
                }
                _ => {}
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Reads a staged chunk. A missing chunk is `Ok(None)`, not an error.
    pub fn read_chunk(&self, id: &str, chunk: u32) -> Result<Option<Vec<u8>>, TransferError> {
        match std::fs::read(self.chunk_path(id, chunk)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes a staged chunk. Deleting a missing chunk succeeds.
    pub fn delete_chunk(&self, id: &str, chunk: u32) -> Result<(), TransferError> {
        match std::fs::remove_file(self.chunk_path(id, chunk)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Deletes the staging directory of `id` if it is empty.
    ///
    /// Fails when chunk files remain; a missing directory succeeds.
    pub fn delete_chunk_directory(&self, id: &str) -> Result<(), TransferError> {
        match std::fs::remove_dir(self.staging_dir(id)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Removes the final artifact of `id`, if any.
    pub fn delete_artifact(&self, id: &str) -> Result<(), TransferError> {
        match std::fs::remove_file(self.artifact_path(id)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
