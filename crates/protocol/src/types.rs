use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of merging an upload's chunks into its final artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state")]
pub enum MergeStatus {
    /// Chunks are still arriving, or the merge has not run yet.
    #[default]
    #[serde(rename = "pending")]
    Pending,
    /// Every chunk was appended and the content hash covers the whole file.
    #[serde(rename = "merged")]
    Merged,
    /// Best-effort merge skipped the listed chunks; the artifact is incomplete.
    #[serde(rename = "partial")]
    Partial {
        #[serde(rename = "failedChunks")]
        failed_chunks: Vec<u32>,
    },
    /// Strict merge stopped at `chunk`; no artifact was kept.
    #[serde(rename = "failed")]
    Failed { chunk: u32, reason: String },
}

/// Persistent state of one upload.
///
/// `chunks[i]` is true once chunk `i + 1` has been durably written.
/// Presence bits only ever flip from false to true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    pub id: String,
    pub original_name: String,
    pub total_chunks: u32,
    pub total_size: u64,
    pub chunks: Vec<bool>,
    /// SHA-256 hex digests supplied with each chunk, when the client sent one.
    #[serde(default)]
    pub chunk_checksums: Vec<Option<String>>,
    pub upload_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub merge_status: MergeStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl UploadRecord {
    /// Creates a record with every chunk still missing.
    pub fn new(
        id: impl Into<String>,
        original_name: impl Into<String>,
        total_chunks: u32,
        total_size: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        let n = total_chunks as usize;
        Self {
            id: id.into(),
            original_name: original_name.into(),
            total_chunks,
            total_size,
            chunks: vec![false; n],
            chunk_checksums: vec![None; n],
            upload_complete: false,
            content_hash: None,
            merge_status: MergeStatus::Pending,
            created_at,
            completed_at: None,
        }
    }

    /// Returns `true` if the 1-based `chunk_number` has been written.
    ///
    /// Out-of-range numbers are reported as absent.
    pub fn is_chunk_present(&self, chunk_number: u32) -> bool {
        chunk_number
            .checked_sub(1)
            .and_then(|i| self.chunks.get(i as usize))
            .copied()
            .unwrap_or(false)
    }

    /// Returns the checksum stored for a chunk, if one was supplied.
    pub fn chunk_checksum(&self, chunk_number: u32) -> Option<&str> {
        chunk_number
            .checked_sub(1)
            .and_then(|i| self.chunk_checksums.get(i as usize))
            .and_then(|c| c.as_deref())
    }

    /// Flips the presence bit for `chunk_number`.
    ///
    /// Returns `false` when the chunk was already present (or out of
    /// range); the record is left untouched in that case.
    pub fn mark_chunk_present(&mut self, chunk_number: u32, checksum: Option<String>) -> bool {
        let Some(i) = chunk_number.checked_sub(1).map(|i| i as usize) else {
            return false;
        };
        match self.chunks.get_mut(i) {
            Some(present) if !*present => *present = true,
            _ => return false,
        }
        if self.chunk_checksums.len() != self.chunks.len() {
            self.chunk_checksums.resize(self.chunks.len(), None);
        }
        self.chunk_checksums[i] = checksum;
        true
    }

    /// Returns `true` once every chunk has been written.
    pub fn all_chunks_present(&self) -> bool {
        self.chunks.iter().all(|&present| present)
    }

    /// Number of chunks written so far.
    pub fn received_chunks(&self) -> u32 {
        self.chunks.iter().filter(|&&present| present).count() as u32
    }

    /// 1-based numbers of the chunks still missing, ascending.
    pub fn missing_chunks(&self) -> Vec<u32> {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, present)| !**present)
            .map(|(i, _)| i as u32 + 1)
            .collect()
    }

    /// Returns the upload progress as a percentage (0-100).
    pub fn percentage(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        self.received_chunks() as f64 / self.total_chunks as f64 * 100.0
    }
}
