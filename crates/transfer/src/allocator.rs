use crate::{ChunkStore, TransferError};

/// Produces candidate identifiers.
pub type IdGenerator = Box<dyn Fn() -> String + Send + Sync>;

/// Hands out identifiers with no on-disk trace under the storage path.
///
/// Only the filesystem is consulted, so allocation never contends with
/// uploads in progress. A candidate that races a concurrent admission of
/// the same value is caught later by the admission collision check.
pub struct IdentifierAllocator {
    store: ChunkStore,
    generator: IdGenerator,
    max_attempts: u32,
}

impl IdentifierAllocator {
    /// Creates an allocator issuing random UUIDv4 strings.
    pub fn new(store: ChunkStore, max_attempts: u32) -> Self {
        Self::with_generator(
            store,
            max_attempts,
            Box::new(|| uuid::Uuid::new_v4().to_string()),
        )
    }

    /// Creates an allocator drawing candidates from `generator`.
    pub fn with_generator(store: ChunkStore, max_attempts: u32, generator: IdGenerator) -> Self {
        Self {
            store,
            generator,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Returns the first candidate with neither an artifact nor a staging
    /// directory, or [`TransferError::AllocationExhausted`].
    pub fn allocate(&self) -> Result<String, TransferError> {
        for attempt in 1..=self.max_attempts {
            let candidate = (self.generator)();
            if !self.store.has_trace(&candidate) {
                return Ok(candidate);
            }
            tracing::debug!(attempt, candidate = %candidate, "identifier collision, retrying");
        }
        tracing::error!(attempts = self.max_attempts, "identifier allocation exhausted");
        Err(TransferError::AllocationExhausted(self.max_attempts))
    }
}
