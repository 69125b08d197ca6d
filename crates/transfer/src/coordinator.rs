use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use chunkdock_protocol::{MergeStatus, UploadRecord};
use tracing::{debug, error, info, warn};

use crate::{
    Admission, ChunkStore, Declaration, IdGenerator, IdentifierAllocator, KeyedLocks, MergeOutcome,
    Merger, RecordStore, StorageConfig, TransferError, check_chunk_index, checksum_bytes,
    validate_identifier,
};

/// Owns the admission, progress and completion state machine of every upload.
///
/// Chunk payloads are written under a lock keyed by upload and chunk
/// number, so distinct chunks of one upload are written in parallel while
/// two copies of the same chunk never both append. The read-flip-write of
/// a record runs under that upload's key, and completion is decided inside
/// the same critical section, so exactly one caller observes the
/// transition. Merges of one upload are serialized and run at most once
/// per recorded outcome.
pub struct Coordinator<S> {
    config: StorageConfig,
    chunks: ChunkStore,
    records: S,
    allocator: IdentifierAllocator,
    merger: Merger,
    locks: KeyedLocks,
    writes: KeyedLocks,
    finalizing: KeyedLocks,
    merges: AtomicUsize,
}

impl<S: RecordStore> Coordinator<S> {
    pub fn new(config: StorageConfig, records: S) -> Self {
        let chunks = ChunkStore::new(&config.base_path);
        Self {
            allocator: IdentifierAllocator::new(chunks.clone(), config.max_allocation_attempts),
            merger: Merger::new(chunks.clone(), config.merge_policy),
            locks: KeyedLocks::new(),
            writes: KeyedLocks::new(),
            finalizing: KeyedLocks::new(),
            merges: AtomicUsize::new(0),
            chunks,
            records,
            config,
        }
    }

    /// Replaces the identifier generator used by [`allocate`](Self::allocate).
    pub fn with_id_generator(mut self, generator: IdGenerator) -> Self {
        self.allocator = IdentifierAllocator::with_generator(
            self.chunks.clone(),
            self.config.max_allocation_attempts,
            generator,
        );
        self
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn chunk_store(&self) -> &ChunkStore {
        &self.chunks
    }

    pub fn records(&self) -> &S {
        &self.records
    }

    /// Number of merges this coordinator has started.
    pub fn merges_run(&self) -> usize {
        self.merges.load(Ordering::SeqCst)
    }

    /// Returns a fresh identifier with no trace on disk.
    pub fn allocate(&self) -> Result<String, TransferError> {
        let id = self.allocator.allocate()?;
        debug!(upload_id = %id, "identifier allocated");
        Ok(id)
    }

    /// Decides whether `chunk` of upload `id` should be transferred.
    ///
    /// The first admission of an identifier creates its record and staging
    /// directory. Later admissions must repeat the same declaration and
    /// have no side effects, except that a completed upload whose merge
    /// outcome was never recorded is merged again.
    pub fn admit(
        &self,
        id: &str,
        decl: &Declaration,
        chunk: u32,
    ) -> Result<Admission, TransferError> {
        validate_identifier(id)?;
        decl.validate(self.config.max_upload_size, self.config.max_total_chunks)?;
        check_chunk_index(chunk, decl.total_chunks)?;

        let (admission, unmerged) = self.locks.with_lock(id, || -> Result<_, TransferError> {
            let record = match self.records.get(id)? {
                Some(record) => {
                    decl.ensure_unchanged(&record)?;
                    record
                }
                None => self.create_record(id, decl)?,
            };

            let admission = if record.is_chunk_present(chunk) {
                Admission::AlreadyPresent
            } else {
                Admission::Ready
            };
            debug!(upload_id = id, chunk, ?admission, "chunk admission");
            Ok((admission, Self::merge_lost(&record)))
        })?;

        if unmerged {
            self.finalize(id)?;
        }
        Ok(admission)
    }

    fn create_record(&self, id: &str, decl: &Declaration) -> Result<UploadRecord, TransferError> {
        if self.chunks.has_trace(id) {
            warn!(upload_id = id, "identifier collides with an existing artifact");
            return Err(TransferError::IdentifierCollision(id.to_string()));
        }

        let record = UploadRecord::new(
            id,
            &decl.file_name,
            decl.total_chunks,
            decl.total_size,
            Utc::now(),
        );
        self.records.create(&record)?;
        self.chunks.create_chunk_directory(id)?;
        info!(
            upload_id = id,
            file_name = %decl.file_name,
            total_chunks = decl.total_chunks,
            total_size = decl.total_size,
            "upload record created"
        );
        Ok(record)
    }

    /// Stores one chunk and returns the record as it stands afterwards.
    ///
    /// A chunk that is already present is ignored and the stored record is
    /// returned unchanged; this covers resumed uploads and late arrivals
    /// after completion. When `checksum` is given it must match the SHA-256
    /// of `payload`. The call that completes the upload runs the merge
    /// before returning.
    pub fn save(
        &self,
        id: &str,
        decl: &Declaration,
        chunk: u32,
        payload: &[u8],
        checksum: Option<&str>,
    ) -> Result<UploadRecord, TransferError> {
        validate_identifier(id)?;
        check_chunk_index(chunk, decl.total_chunks)?;
        let checksum = checksum.filter(|c| !c.is_empty());

        let record = self.load(id)?;
        decl.ensure_unchanged(&record)?;

        if record.is_chunk_present(chunk) {
            return self.redundant(record, chunk, checksum);
        }

        let checksum = match checksum {
            Some(expected) => {
                let actual = checksum_bytes(payload);
                if !actual.eq_ignore_ascii_case(expected) {
                    warn!(upload_id = id, chunk, "chunk checksum mismatch");
                    return Err(TransferError::ChecksumMismatch { chunk });
                }
                Some(actual)
            }
            None => None,
        };

        let write_key = format!("{id}/{chunk}");
        let stored = self.writes.with_lock(&write_key, || -> Result<_, TransferError> {
            if self.load(id)?.is_chunk_present(chunk) {
                return Ok(None);
            }

            if let Err(e) = self.chunks.write_chunk(id, chunk, payload) {
                error!(upload_id = id, chunk, error = %e, "chunk write failed");
                return Err(e);
            }
            debug!(upload_id = id, chunk, bytes = payload.len(), "chunk written");

            self.locks
                .with_lock(id, || -> Result<_, TransferError> {
                    let mut record = self.load(id)?;
                    if !record.mark_chunk_present(chunk, checksum.clone()) {
                        return Ok((record, false));
                    }
                    let completed = !record.upload_complete && record.all_chunks_present();
                    if completed {
                        record.upload_complete = true;
                    }
                    self.records.put(&record)?;
                    Ok((record, completed))
                })
                .map(Some)
        })?;

        let Some((record, completed)) = stored else {
            // A concurrent save of the same chunk got here first.
            return self.redundant(self.load(id)?, chunk, checksum.as_deref());
        };
        if !completed {
            return Ok(record);
        }
        info!(upload_id = id, total_chunks = record.total_chunks, "all chunks received");
        self.finalize(id)
    }

    /// Returns the stored record of `id`.
    pub fn get_record(&self, id: &str) -> Result<UploadRecord, TransferError> {
        validate_identifier(id)?;
        self.load(id)
    }

    fn load(&self, id: &str) -> Result<UploadRecord, TransferError> {
        self.records
            .get(id)?
            .ok_or_else(|| TransferError::UploadNotFound(id.to_string()))
    }

    fn redundant(
        &self,
        record: UploadRecord,
        chunk: u32,
        checksum: Option<&str>,
    ) -> Result<UploadRecord, TransferError> {
        if let (Some(sent), Some(stored)) = (checksum, record.chunk_checksum(chunk))
            && !sent.eq_ignore_ascii_case(stored)
        {
            warn!(upload_id = %record.id, chunk, "re-sent chunk differs from stored chunk");
            return Err(TransferError::ChunkConflict {
                upload_id: record.id.clone(),
                chunk,
            });
        }
        debug!(upload_id = %record.id, chunk, "chunk already present, ignoring");
        if Self::merge_lost(&record) {
            return self.finalize(&record.id);
        }
        Ok(record)
    }

    /// A complete upload still `pending` is either merging right now or
    /// lost its merge outcome to a failed record write.
    fn merge_lost(record: &UploadRecord) -> bool {
        record.upload_complete && record.merge_status == MergeStatus::Pending
    }

    /// Merges a completed upload and records the outcome.
    ///
    /// Merge failures never roll back `upload_complete`; the record keeps a
    /// `failed` merge status for manual recovery. Staged chunks are released
    /// only after the outcome is stored, so a failed record write leaves
    /// everything in place for the next attempt.
    fn finalize(&self, id: &str) -> Result<UploadRecord, TransferError> {
        self.finalizing.with_lock(id, || -> Result<UploadRecord, TransferError> {
            let snapshot = self.load(id)?;
            if snapshot.merge_status != MergeStatus::Pending {
                // Recorded by another caller while this one waited.
                return Self::merge_result(snapshot);
            }
            self.merges.fetch_add(1, Ordering::SeqCst);
            debug!(upload_id = id, policy = ?self.merger.policy(), "merging chunks");

            let outcome = self.merger.merge(&snapshot).unwrap_or_else(|e| MergeOutcome {
                content_hash: None,
                status: MergeStatus::Failed {
                    chunk: 0,
                    reason: e.to_string(),
                },
            });

            let record = self.locks.with_lock(id, || -> Result<_, TransferError> {
                let mut record = self.load(id)?;
                if outcome.content_hash.is_some() {
                    record.completed_at = Some(Utc::now());
                }
                record.content_hash = outcome.content_hash;
                record.merge_status = outcome.status;
                self.records.put(&record)?;
                Ok(record)
            })?;

            self.merger
                .release_chunks(id, record.total_chunks, &record.merge_status);
            Self::merge_result(record)
        })
    }

    fn merge_result(record: UploadRecord) -> Result<UploadRecord, TransferError> {
        match &record.merge_status {
            MergeStatus::Failed { chunk, reason } => {
                error!(upload_id = %record.id, chunk, %reason, "merge failed");
                Err(TransferError::MergeFailed {
                    upload_id: record.id.clone(),
                    chunk: *chunk,
                    reason: reason.clone(),
                })
            }
            MergeStatus::Partial { failed_chunks } => {
                warn!(upload_id = %record.id, ?failed_chunks, "upload merged with missing chunks");
                Ok(record)
            }
            MergeStatus::Merged | MergeStatus::Pending => {
                info!(
                    upload_id = %record.id,
                    content_hash = record.content_hash.as_deref().unwrap_or_default(),
                    "upload merged"
                );
                Ok(record)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use tempfile::TempDir;

    use super::*;
    use crate::{FileRecordStore, MemoryRecordStore, MergePolicy};

    fn coordinator(dir: &TempDir) -> Coordinator<MemoryRecordStore> {
        Coordinator::new(StorageConfig::new(dir.path()), MemoryRecordStore::new())
    }

    fn decl(total_chunks: u32, total_size: u64) -> Declaration {
        Declaration::new("a.bin", total_chunks, total_size)
    }

    /// Memory store that fails the first write of a merge outcome.
    struct LosesMergeOutcome {
        inner: MemoryRecordStore,
        armed: AtomicBool,
    }

    impl LosesMergeOutcome {
        fn new() -> Self {
            Self {
                inner: MemoryRecordStore::new(),
                armed: AtomicBool::new(true),
            }
        }
    }

    impl RecordStore for LosesMergeOutcome {
        fn create(&self, record: &UploadRecord) -> Result<(), TransferError> {
            self.inner.create(record)
        }

        fn get(&self, id: &str) -> Result<Option<UploadRecord>, TransferError> {
            self.inner.get(id)
        }

        fn put(&self, record: &UploadRecord) -> Result<(), TransferError> {
            if record.merge_status != MergeStatus::Pending && self.armed.swap(false, Ordering::SeqCst)
            {
                return Err(TransferError::Io(std::io::Error::other("disk full")));
            }
            self.inner.put(record)
        }
    }

    #[test]
    fn two_chunk_upload_completes_and_merges() {
        let dir = TempDir::new().unwrap();
        let c = coordinator(&dir);
        let d = decl(2, 20);

        assert_eq!(c.admit("u1", &d, 1).unwrap(), Admission::Ready);

        let first = [b'a'; 10];
        let r = c.save("u1", &d, 1, &first, None).unwrap();
        assert_eq!(r.chunks, vec![true, false]);
        assert!(!r.upload_complete);
        assert!(r.content_hash.is_none());

        let second = [b'b'; 10];
        let r = c.save("u1", &d, 2, &second, None).unwrap();
        assert_eq!(r.chunks, vec![true, true]);
        assert!(r.upload_complete);
        assert_eq!(r.merge_status, MergeStatus::Merged);
        assert!(r.completed_at.is_some());

        let mut whole = first.to_vec();
        whole.extend_from_slice(&second);
        assert_eq!(r.content_hash.as_deref(), Some(checksum_bytes(&whole).as_str()));

        let artifact = std::fs::read(c.chunk_store().artifact_path("u1")).unwrap();
        assert_eq!(artifact.len(), 20);
        assert_eq!(artifact, whole);
        assert!(!c.chunk_store().chunk_directory_exists("u1"));
        assert_eq!(c.merges_run(), 1);
        assert_eq!(c.get_record("u1").unwrap(), r);
    }

    #[test]
    fn oversize_declaration_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let c = coordinator(&dir);

        let err = c.admit("u2", &decl(1, 5_000_000_000), 1).unwrap_err();
        assert!(matches!(err, TransferError::TooLarge { .. }));
        assert!(matches!(
            c.get_record("u2"),
            Err(TransferError::UploadNotFound(_))
        ));
        assert!(!c.chunk_store().chunk_directory_exists("u2"));
    }

    #[test]
    fn max_size_is_configurable() {
        let dir = TempDir::new().unwrap();
        let c = Coordinator::new(
            StorageConfig::new(dir.path()).with_max_upload_size(100),
            MemoryRecordStore::new(),
        );
        assert!(c.admit("u1", &decl(1, 100), 1).is_ok());
        assert!(matches!(
            c.admit("u2", &decl(1, 101), 1),
            Err(TransferError::TooLarge { declared: 101, max: 100 })
        ));
    }

    #[test]
    fn changed_declaration_is_rejected() {
        let dir = TempDir::new().unwrap();
        let c = coordinator(&dir);
        c.admit("u1", &decl(2, 20), 1).unwrap();

        let changed = Declaration::new("b.bin", 2, 20);
        let err = c.admit("u1", &changed, 1).unwrap_err();
        assert!(matches!(err, TransferError::FlowChanged { field: "fileName", .. }));
        assert!(!err.is_retryable());

        let err = c.save("u1", &decl(3, 20), 1, b"x", None).unwrap_err();
        assert!(matches!(err, TransferError::FlowChanged { field: "totalChunks", .. }));

        let r = c.get_record("u1").unwrap();
        assert_eq!(r.original_name, "a.bin");
        assert_eq!(r.chunks, vec![false, false]);
    }

    #[test]
    fn admit_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let c = coordinator(&dir);
        let d = decl(2, 20);

        assert_eq!(c.admit("u1", &d, 1).unwrap(), Admission::Ready);
        let created = c.get_record("u1").unwrap();
        assert_eq!(c.admit("u1", &d, 1).unwrap(), Admission::Ready);
        assert_eq!(c.admit("u1", &d, 2).unwrap(), Admission::Ready);
        assert_eq!(c.get_record("u1").unwrap(), created);
        assert_eq!(c.records().len(), 1);
        assert!(c.chunk_store().chunk_directory_exists("u1"));

        c.save("u1", &d, 1, &[0; 10], None).unwrap();
        assert!(c.admit("u1", &d, 1).unwrap().is_already_present());
        assert_eq!(c.admit("u1", &d, 2).unwrap(), Admission::Ready);
    }

    #[test]
    fn save_requires_admission() {
        let dir = TempDir::new().unwrap();
        let c = coordinator(&dir);
        let err = c.save("nope", &decl(1, 1), 1, b"x", None).unwrap_err();
        assert!(matches!(err, TransferError::UploadNotFound(_)));
        assert!(!c.chunk_store().has_trace("nope"));
    }

    #[test]
    fn resend_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let c = coordinator(&dir);
        let d = decl(2, 20);
        c.admit("u1", &d, 1).unwrap();

        let first = c.save("u1", &d, 1, b"0123456789", None).unwrap();
        let again = c.save("u1", &d, 1, b"0123456789", None).unwrap();
        assert_eq!(first, again);
        assert_eq!(
            c.chunk_store().read_chunk("u1", 1).unwrap().unwrap(),
            b"0123456789"
        );
    }

    #[test]
    fn existing_artifact_is_a_collision() {
        let dir = TempDir::new().unwrap();
        let c = coordinator(&dir);
        std::fs::write(c.chunk_store().artifact_path("u3"), b"old").unwrap();

        let err = c.admit("u3", &decl(1, 3), 1).unwrap_err();
        assert!(matches!(err, TransferError::IdentifierCollision(_)));
        assert!(c.records().is_empty());
    }

    #[test]
    fn malformed_requests_are_protocol_errors() {
        let dir = TempDir::new().unwrap();
        let c = coordinator(&dir);
        let d = decl(2, 20);

        assert!(matches!(
            c.admit("../u1", &d, 1),
            Err(TransferError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            c.get_record(""),
            Err(TransferError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            c.admit("u1", &d, 3),
            Err(TransferError::InvalidChunkIndex { chunk: 3, total_chunks: 2 })
        ));
        c.admit("u1", &d, 1).unwrap();
        assert!(matches!(
            c.save("u1", &d, 0, b"x", None),
            Err(TransferError::InvalidChunkIndex { chunk: 0, .. })
        ));
    }

    #[test]
    fn chunks_may_arrive_out_of_order() {
        let dir = TempDir::new().unwrap();
        let c = coordinator(&dir);
        let d = decl(3, 9);
        c.admit("u1", &d, 3).unwrap();

        c.save("u1", &d, 3, b"ccc", None).unwrap();
        c.save("u1", &d, 1, b"aaa", None).unwrap();
        let r = c.save("u1", &d, 2, b"bbb", None).unwrap();
        assert!(r.upload_complete);

        let artifact = std::fs::read(c.chunk_store().artifact_path("u1")).unwrap();
        assert_eq!(artifact, b"aaabbbccc");
    }

    #[test]
    fn checksum_is_verified_before_write() {
        let dir = TempDir::new().unwrap();
        let c = coordinator(&dir);
        let d = decl(2, 10);
        c.admit("u1", &d, 1).unwrap();

        let bad = "0".repeat(64);
        let err = c.save("u1", &d, 1, b"hello", Some(&bad)).unwrap_err();
        assert!(matches!(err, TransferError::ChecksumMismatch { chunk: 1 }));
        assert!(err.is_retryable());
        assert!(c.chunk_store().read_chunk("u1", 1).unwrap().is_none());
        assert!(!c.get_record("u1").unwrap().is_chunk_present(1));

        let good = checksum_bytes(b"hello").to_uppercase();
        let r = c.save("u1", &d, 1, b"hello", Some(&good)).unwrap();
        assert_eq!(r.chunk_checksum(1), Some(checksum_bytes(b"hello").as_str()));
    }

    #[test]
    fn conflicting_resend_is_detected() {
        let dir = TempDir::new().unwrap();
        let c = coordinator(&dir);
        let d = decl(2, 10);
        c.admit("u1", &d, 1).unwrap();

        let sum = checksum_bytes(b"hello");
        let stored = c.save("u1", &d, 1, b"hello", Some(&sum)).unwrap();

        // Same bytes: ignored.
        assert_eq!(c.save("u1", &d, 1, b"hello", Some(&sum)).unwrap(), stored);
        // No checksum: unchecked.
        assert_eq!(c.save("u1", &d, 1, b"other", None).unwrap(), stored);

        let other = checksum_bytes(b"world");
        let err = c.save("u1", &d, 1, b"world", Some(&other)).unwrap_err();
        assert!(matches!(err, TransferError::ChunkConflict { chunk: 1, .. }));
        assert_eq!(c.get_record("u1").unwrap(), stored);
    }

    #[test]
    fn failed_write_leaves_chunk_missing() {
        let dir = TempDir::new().unwrap();
        let c = coordinator(&dir);
        let d = decl(1, 4);
        c.admit("u1", &d, 1).unwrap();

        let blocker = c.chunk_store().chunk_path("u1", 1);
        std::fs::create_dir(&blocker).unwrap();
        let err = c.save("u1", &d, 1, b"data", None).unwrap_err();
        assert!(err.is_retryable());
        assert!(!c.get_record("u1").unwrap().is_chunk_present(1));

        std::fs::remove_dir(&blocker).unwrap();
        let r = c.save("u1", &d, 1, b"data", None).unwrap();
        assert!(r.upload_complete);
        assert_eq!(r.content_hash, Some(checksum_bytes(b"data")));
    }

    #[test]
    fn strict_merge_failure_is_surfaced() {
        let dir = TempDir::new().unwrap();
        let c = coordinator(&dir);
        let d = decl(2, 4);
        c.admit("u1", &d, 1).unwrap();
        c.save("u1", &d, 1, b"aa", None).unwrap();
        c.chunk_store().delete_chunk("u1", 1).unwrap();

        let err = c.save("u1", &d, 2, b"bb", None).unwrap_err();
        assert!(matches!(err, TransferError::MergeFailed { chunk: 1, .. }));
        assert!(!err.is_retryable());

        let r = c.get_record("u1").unwrap();
        assert!(r.upload_complete);
        assert!(r.content_hash.is_none());
        assert!(r.completed_at.is_none());
        assert!(matches!(r.merge_status, MergeStatus::Failed { chunk: 1, .. }));
        assert!(!c.chunk_store().artifact_exists("u1"));
        assert_eq!(c.chunk_store().read_chunk("u1", 2).unwrap().unwrap(), b"bb");

        // A late retry does not re-run the merge.
        assert_eq!(c.save("u1", &d, 2, b"bb", None).unwrap(), r);
        assert_eq!(c.merges_run(), 1);
    }

    #[test]
    fn best_effort_merge_reports_partial() {
        let dir = TempDir::new().unwrap();
        let c = Coordinator::new(
            StorageConfig::new(dir.path()).with_merge_policy(MergePolicy::BestEffort),
            MemoryRecordStore::new(),
        );
        let d = decl(2, 4);
        c.admit("u1", &d, 1).unwrap();
        c.save("u1", &d, 1, b"aa", None).unwrap();
        c.chunk_store().delete_chunk("u1", 1).unwrap();

        let r = c.save("u1", &d, 2, b"bb", None).unwrap();
        assert!(r.upload_complete);
        assert_eq!(
            r.merge_status,
            MergeStatus::Partial {
                failed_chunks: vec![1]
            }
        );
        assert_eq!(r.content_hash, Some(checksum_bytes(b"bb")));
    }

    #[test]
    fn late_arrivals_after_completion_are_ignored() {
        let dir = TempDir::new().unwrap();
        let c = coordinator(&dir);
        let d = decl(1, 3);
        c.admit("u1", &d, 1).unwrap();
        let done = c.save("u1", &d, 1, b"abc", None).unwrap();
        assert!(done.upload_complete);

        assert_eq!(c.save("u1", &d, 1, b"xyz", None).unwrap(), done);
        assert!(c.admit("u1", &d, 1).unwrap().is_already_present());
        assert_eq!(c.merges_run(), 1);
        assert!(!c.chunk_store().chunk_directory_exists("u1"));
        assert_eq!(
            std::fs::read(c.chunk_store().artifact_path("u1")).unwrap(),
            b"abc"
        );
    }

    #[test]
    fn concurrent_saves_merge_exactly_once() {
        const N: u32 = 16;
        let dir = TempDir::new().unwrap();
        let c = Arc::new(coordinator(&dir));
        let d = decl(N, u64::from(N) * 4);
        c.admit("u1", &d, 1).unwrap();

        let handles: Vec<_> = (1..=N)
            .map(|chunk| {
                let c = Arc::clone(&c);
                let d = d.clone();
                thread::spawn(move || {
                    let payload = format!("{chunk:04}");
                    c.save("u1", &d, chunk, payload.as_bytes(), None).unwrap()
                })
            })
            .collect();
        let completed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| r.content_hash.is_some())
            .count();

        assert_eq!(completed, 1);
        assert_eq!(c.merges_run(), 1);
        let r = c.get_record("u1").unwrap();
        assert!(r.chunks.iter().all(|&p| p));
        assert_eq!(r.merge_status, MergeStatus::Merged);

        let expected: String = (1..=N).map(|n| format!("{n:04}")).collect();
        let artifact = std::fs::read(c.chunk_store().artifact_path("u1")).unwrap();
        assert_eq!(artifact, expected.as_bytes());
    }

    #[test]
    fn concurrent_first_admissions_create_one_record() {
        let dir = TempDir::new().unwrap();
        let c = Arc::new(coordinator(&dir));

        let handles: Vec<_> = (1..=8)
            .map(|chunk| {
                let c = Arc::clone(&c);
                thread::spawn(move || c.admit("u1", &decl(8, 80), chunk))
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap().unwrap(), Admission::Ready);
        }
        assert_eq!(c.records().len(), 1);
    }

    #[test]
    fn file_backed_upload_survives_restart() {
        let dir = TempDir::new().unwrap();
        let storage = dir.path().join("data");
        let records = dir.path().join("records");
        let d = decl(2, 4);

        {
            let c = Coordinator::new(
                StorageConfig::new(&storage),
                FileRecordStore::open(&records).unwrap(),
            );
            c.admit("u1", &d, 1).unwrap();
            c.save("u1", &d, 1, b"ab", None).unwrap();
        }

        let c = Coordinator::new(
            StorageConfig::new(&storage),
            FileRecordStore::open(&records).unwrap(),
        );
        assert!(c.admit("u1", &d, 1).unwrap().is_already_present());
        let r = c.save("u1", &d, 2, b"cd", None).unwrap();
        assert!(r.upload_complete);
        assert_eq!(std::fs::read(storage.join("u1")).unwrap(), b"abcd");
    }

    #[test]
    fn allocate_avoids_existing_traces() {
        let dir = TempDir::new().unwrap();
        let ids = std::sync::Mutex::new(vec!["fresh".to_string(), "u1".to_string()]);
        let c = coordinator(&dir).with_id_generator(Box::new(move || {
            ids.lock().unwrap().pop().unwrap_or_else(|| "spare".into())
        }));
        c.admit("u1", &decl(1, 1), 1).unwrap();

        assert_eq!(c.allocate().unwrap(), "fresh");
    }

    #[test]
    fn chunk_count_is_bounded_before_allocation() {
        let dir = TempDir::new().unwrap();
        let c = coordinator(&dir);

        let err = c.admit("u1", &decl(u32::MAX, 0), 1).unwrap_err();
        assert!(matches!(err, TransferError::InvalidDeclaration(_)));
        assert!(!err.is_retryable());
        let err = c.admit("u1", &decl(3, 2), 1).unwrap_err();
        assert!(matches!(err, TransferError::InvalidDeclaration(_)));
        assert!(c.records().is_empty());
        assert!(!c.chunk_store().has_trace("u1"));

        let c = Coordinator::new(
            StorageConfig::new(dir.path()).with_max_total_chunks(4),
            MemoryRecordStore::new(),
        );
        assert!(c.admit("u2", &decl(4, 400), 1).is_ok());
        assert!(matches!(
            c.admit("u3", &decl(5, 500), 1),
            Err(TransferError::InvalidDeclaration(_))
        ));
    }

    #[test]
    fn racing_copies_of_the_last_chunk_are_written_once() {
        const ROUNDS: usize = 50;
        let dir = TempDir::new().unwrap();
        let c = Arc::new(coordinator(&dir));
        let d = decl(2, 8);

        for round in 0..ROUNDS {
            let id = format!("u{round}");
            c.admit(&id, &d, 1).unwrap();
            c.save(&id, &d, 1, b"aaaa", None).unwrap();

            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let c = Arc::clone(&c);
                    let d = d.clone();
                    let id = id.clone();
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        c.save(&id, &d, 2, b"bbbb", None).unwrap()
                    })
                })
                .collect();
            for h in handles {
                assert_eq!(h.join().unwrap().merge_status, MergeStatus::Merged);
            }

            let artifact = std::fs::read(c.chunk_store().artifact_path(&id)).unwrap();
            assert_eq!(artifact, b"aaaabbbb", "round {round}");
            assert_eq!(
                c.get_record(&id).unwrap().content_hash,
                Some(checksum_bytes(b"aaaabbbb"))
            );
        }
        assert_eq!(c.merges_run(), ROUNDS);
    }

    #[test]
    fn lost_merge_outcome_is_merged_again() {
        for via_admit in [false, true] {
            let dir = TempDir::new().unwrap();
            let c = Coordinator::new(StorageConfig::new(dir.path()), LosesMergeOutcome::new());
            let d = decl(2, 4);
            c.admit("u1", &d, 1).unwrap();
            c.save("u1", &d, 1, b"ab", None).unwrap();

            let err = c.save("u1", &d, 2, b"cd", None).unwrap_err();
            assert!(err.is_retryable());
            let stuck = c.get_record("u1").unwrap();
            assert!(stuck.upload_complete);
            assert_eq!(stuck.merge_status, MergeStatus::Pending);
            assert_eq!(c.chunk_store().read_chunk("u1", 1).unwrap().unwrap(), b"ab");

            if via_admit {
                assert_eq!(c.admit("u1", &d, 2).unwrap(), Admission::AlreadyPresent);
            } else {
                let r = c.save("u1", &d, 2, b"cd", None).unwrap();
                assert_eq!(r.merge_status, MergeStatus::Merged);
            }

            let r = c.get_record("u1").unwrap();
            assert_eq!(r.merge_status, MergeStatus::Merged);
            assert_eq!(r.content_hash, Some(checksum_bytes(b"abcd")));
            assert!(r.completed_at.is_some());
            assert_eq!(
                std::fs::read(c.chunk_store().artifact_path("u1")).unwrap(),
                b"abcd"
            );
            assert!(!c.chunk_store().chunk_directory_exists("u1"));
            assert_eq!(c.merges_run(), 2);

            // Once recorded, retries leave the outcome alone.
            c.save("u1", &d, 2, b"cd", None).unwrap();
            assert_eq!(c.merges_run(), 2);
        }
    }
}
