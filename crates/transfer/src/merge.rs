use std::fs::File;
use std::io::{BufWriter, Write};

use chunkdock_protocol::{MergeStatus, UploadRecord};

use crate::{ChunkStore, MergePolicy, TransferError, calculate_file_checksum};

/// Result of one merge run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// SHA-256 of the artifact; `None` when no artifact was kept.
    pub content_hash: Option<String>,
    pub status: MergeStatus,
}

/// Concatenates staged chunks into the final artifact.
pub struct Merger {
    store: ChunkStore,
    policy: MergePolicy,
}

impl Merger {
    pub fn new(store: ChunkStore, policy: MergePolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    /// Appends chunks `1..=total_chunks` of `record` to the artifact in order.
    ///
    /// Staged chunks are left in place; callers release them with
    /// [`release_chunks`](Self::release_chunks) once the outcome is stored.
    /// An artifact whose length differs from the declared total size is
    /// never reported as `merged`. Per-chunk failures are reported through
    /// [`MergeOutcome::status`]; `Err` is reserved for failures of the
    /// artifact itself.
    pub fn merge(&self, record: &UploadRecord) -> Result<MergeOutcome, TransferError> {
        let id = record.id.as_str();
        if let Some(&chunk) = record.missing_chunks().first() {
            tracing::error!(upload_id = id, chunk, "merge requested before all chunks arrived");
            return Ok(MergeOutcome {
                content_hash: None,
                status: MergeStatus::Failed {
                    chunk,
                    reason: "chunk not received".into(),
                },
            });
        }

        let artifact_path = self.store.artifact_path(id);
        let mut artifact = BufWriter::new(File::create(&artifact_path)?);

        let mut written: u64 = 0;
        let mut failed = Vec::new();

        for chunk in 1..=record.total_chunks {
            let result = match self.store.read_chunk(id, chunk) {
                Ok(Some(data)) => artifact
                    .write_all(&data)
                    .map(|()| data.len() as u64)
                    .map_err(|e| e.to_string()),
                Ok(None) => Err("chunk missing from staging".to_string()),
                Err(e) => Err(e.to_string()),
            };

            match result {
                Ok(len) => written += len,
                Err(reason) => match self.policy {
                    MergePolicy::Strict => {
                        tracing::error!(upload_id = id, chunk, %reason, "merge aborted");
                        drop(artifact);
                        return Ok(self.discard(id, chunk, reason));
                    }
                    MergePolicy::BestEffort => {
                        tracing::warn!(upload_id = id, chunk, %reason, "skipping chunk during merge");
                        failed.push(chunk);
                    }
                },
            }
        }

        artifact
            .into_inner()
            .map_err(|e| e.into_error())?
            .sync_all()?;

        let size_matches = written == record.total_size;
        if !size_matches {
            let reason = format!(
                "merged {written} bytes, declared {}",
                record.total_size
            );
            if self.policy == MergePolicy::Strict {
                tracing::error!(upload_id = id, %reason, "merged artifact has the wrong size");
                return Ok(self.discard(id, 0, reason));
            }
            tracing::warn!(upload_id = id, %reason, "merged artifact has the wrong size");
        }

        let content_hash = calculate_file_checksum(&artifact_path)?;
        let status = if failed.is_empty() && size_matches {
            MergeStatus::Merged
        } else {
            MergeStatus::Partial {
                failed_chunks: failed,
            }
        };
        Ok(MergeOutcome {
            content_hash: Some(content_hash),
            status,
        })
    }

    /// Deletes the staged chunks that made it into the artifact.
    ///
    /// Chunks a merge could not append stay staged, and so does the
    /// staging directory that holds them.
    pub fn release_chunks(&self, id: &str, total_chunks: u32, status: &MergeStatus) {
        let kept: &[u32] = match status {
            MergeStatus::Merged => &[],
            MergeStatus::Partial { failed_chunks } => failed_chunks.as_slice(),
            MergeStatus::Pending | MergeStatus::Failed { .. } => return,
        };

        for chunk in (1..=total_chunks).filter(|c| !kept.contains(c)) {
            if let Err(e) = self.store.delete_chunk(id, chunk) {
                tracing::warn!(upload_id = id, chunk, error = %e, "failed to delete merged chunk");
            }
        }
        if kept.is_empty()
            && let Err(e) = self.store.delete_chunk_directory(id)
        {
            tracing::warn!(upload_id = id, error = %e, "failed to delete staging directory");
        }
    }

    fn discard(&self, id: &str, chunk: u32, reason: String) -> MergeOutcome {
        if let Err(e) = self.store.delete_artifact(id) {
            tracing::warn!(upload_id = id, error = %e, "failed to remove partial artifact");
        }
        MergeOutcome {
            content_hash: None,
            status: MergeStatus::Failed { chunk, reason },
        }
    }
}
