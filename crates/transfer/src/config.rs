use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default upper bound on a declared upload size: 4 GiB.
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Default number of colliding candidates the allocator tolerates.
pub const DEFAULT_MAX_ALLOCATION_ATTEMPTS: u32 = 1000;

/// Default ceiling on the chunk count of one upload.
///
/// A record carries a presence bit and a checksum slot per chunk, so the
/// declared count is bounded before any record is allocated.
pub const DEFAULT_MAX_TOTAL_CHUNKS: u32 = 100_000;

/// What the merger does when one chunk cannot be appended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Abort on the first failure, discard the partial artifact and keep
    /// the staged chunks for manual recovery.
    #[default]
    Strict,
    /// Skip failing chunks and record them in a `partial` merge status.
    BestEffort,
}

/// Storage settings shared by the allocator, chunk store and coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    /// Directory holding final artifacts and per-upload staging directories.
    pub base_path: PathBuf,
    pub max_upload_size: u64,
    pub merge_policy: MergePolicy,
    pub max_allocation_attempts: u32,
    pub max_total_chunks: u32,
}

impl StorageConfig {
    /// Creates a config rooted at `base_path` with default limits.
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
            merge_policy: MergePolicy::default(),
            max_allocation_attempts: DEFAULT_MAX_ALLOCATION_ATTEMPTS,
            max_total_chunks: DEFAULT_MAX_TOTAL_CHUNKS,
        }
    }

    pub fn with_max_upload_size(mut self, max: u64) -> Self {
        self.max_upload_size = max;
        self
    }

    pub fn with_merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }

    pub fn with_max_allocation_attempts(mut self, attempts: u32) -> Self {
        self.max_allocation_attempts = attempts;
        self
    }

    pub fn with_max_total_chunks(mut self, max: u32) -> Self {
        self.max_total_chunks = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = StorageConfig::new("/srv/uploads");
        assert_eq!(cfg.base_path, PathBuf::from("/srv/uploads"));
        assert_eq!(cfg.max_upload_size, 4_294_967_296);
        assert_eq!(cfg.merge_policy, MergePolicy::Strict);
        assert_eq!(cfg.max_allocation_attempts, 1000);
        assert_eq!(cfg.max_total_chunks, 100_000);
    }

    #[test]
    fn merge_policy_names() {
        assert_eq!(
            serde_json::to_string(&MergePolicy::BestEffort).unwrap(),
            "\"best_effort\""
        );
        let p: MergePolicy = serde_json::from_str("\"strict\"").unwrap();
        assert_eq!(p, MergePolicy::Strict);
    }
}
