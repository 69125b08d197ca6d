use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chunkdock_protocol::UploadRecord;

use crate::{TransferError, validate_identifier};

/// Durable storage of one [`UploadRecord`] per upload identifier.
///
/// Only point operations are required. Overwrites are last-write-wins;
/// callers serialize read-modify-write cycles themselves.
pub trait RecordStore: Send + Sync {
    /// Stores a new record, failing with [`TransferError::RecordExists`]
    /// if its id is already taken.
    fn create(&self, record: &UploadRecord) -> Result<(), TransferError>;

    /// Looks up a record by id.
    fn get(&self, id: &str) -> Result<Option<UploadRecord>, TransferError>;

    /// Overwrites the record stored under `record.id`.
    fn put(&self, record: &UploadRecord) -> Result<(), TransferError>;
}

// ---------------------------------------------------------------------------
// MemoryRecordStore
// ---------------------------------------------------------------------------

/// In-process record store, lost on restart.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<String, UploadRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordStore for MemoryRecordStore {
    fn create(&self, record: &UploadRecord) -> Result<(), TransferError> {
        let mut records = self.records.write().unwrap();
        if records.contains_key(&record.id) {
            return Err(TransferError::RecordExists(record.id.clone()));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<UploadRecord>, TransferError> {
        Ok(self.records.read().unwrap().get(id).cloned())
    }

    fn put(&self, record: &UploadRecord) -> Result<(), TransferError> {
        self.records
            .write()
            .unwrap()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FileRecordStore
// ---------------------------------------------------------------------------

/// Record store keeping one JSON document per upload: `<dir>/<id>.json`.
///
/// Every write goes to a temporary sibling first and is renamed into
/// place, so readers never observe a half-written record.
#[derive(Debug, Clone)]
pub struct FileRecordStore {
    dir: PathBuf,
}

impl FileRecordStore {
    /// Opens (creating if needed) the record directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, TransferError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Returns the record directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> Result<PathBuf, TransferError> {
        validate_identifier(id)?;
        Ok(self.dir.join(format!("{id}.json")))
    }

    fn write_atomic(&self, path: &Path, record: &UploadRecord) -> Result<(), TransferError> {
        let json = serde_json::to_vec_pretty(record)?;
        let tmp = self.dir.join(format!(".{}.json.tmp", record.id));
        std::fs::write(&tmp, json)?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

impl RecordStore for FileRecordStore {
    fn create(&self, record: &UploadRecord) -> Result<(), TransferError> {
        let path = self.record_path(&record.id)?;
        if path.exists() {
            return Err(TransferError::RecordExists(record.id.clone()));
        }
        self.write_atomic(&path, record)
    }

    fn get(&self, id: &str) -> Result<Option<UploadRecord>, TransferError> {
        let path = self.record_path(id)?;
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, record: &UploadRecord) -> Result<(), TransferError> {
        let path = self.record_path(&record.id)?;
        self.write_atomic(&path, record)
    }
}
