use serde::{Deserialize, Serialize};

use crate::types::UploadRecord;

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Asks whether a chunk should be transferred.
///
/// The first admission for an identifier creates its record; later ones
/// must repeat the same file name, chunk count and total size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmitChunkRequest {
    pub upload_id: String,
    pub file_name: String,
    pub total_chunks: u32,
    pub total_size: u64,
    pub chunk_number: u32,
}

/// Sends one chunk inside a JSON envelope.
///
/// The `data` field is base64-encoded. Large payloads should use the
/// binary frame instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveChunkRequest {
    pub upload_id: String,
    pub file_name: String,
    pub total_chunks: u32,
    pub total_size: u64,
    pub chunk_number: u32,
    pub current_chunk_size: u64,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// SHA-256 hex of `data` (empty means no verification).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
}

/// Looks up an upload record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRecordRequest {
    pub upload_id: String,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// A freshly allocated upload identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifierResponse {
    pub upload_id: String,
}

/// Result of an admission test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmitChunkResponse {
    pub upload_id: String,
    pub chunk_number: u32,
    /// `true` means the chunk is already stored and should be skipped.
    pub chunk_already_present: bool,
}

/// Acknowledges a chunk with the record as it stands afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSavedResponse {
    pub upload_id: String,
    pub chunk_number: u32,
    pub record: UploadRecord,
}

/// Response to `get_record`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordResponse {
    pub record: UploadRecord,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Pushed after every chunk that changed an upload's record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgressEvent {
    pub upload_id: String,
    pub received_chunks: u32,
    pub total_chunks: u32,
    pub percentage: f64,
    pub upload_complete: bool,
}

impl From<&UploadRecord> for UploadProgressEvent {
    fn from(record: &UploadRecord) -> Self {
        Self {
            upload_id: record.id.clone(),
            received_chunks: record.received_chunks(),
            total_chunks: record.total_chunks,
            percentage: record.percentage(),
            upload_complete: record.upload_complete,
        }
    }
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn save_chunk_data_is_base64() {
        let req = SaveChunkRequest {
            upload_id: "u1".into(),
            file_name: "a.bin".into(),
            total_chunks: 2,
            total_size: 20,
            chunk_number: 1,
            current_chunk_size: 5,
            data: b"hello".to_vec(),
            checksum: String::new(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["data"], "aGVsbG8=");
        assert_eq!(json["currentChunkSize"], 5);
        assert!(json.get("checksum").is_none());

        let back: SaveChunkRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back.data, b"hello");
    }

    #[test]
    fn save_chunk_rejects_bad_base64() {
        let json = r#"{
            "uploadId": "u1", "fileName": "a.bin", "totalChunks": 1, "totalSize": 1,
            "chunkNumber": 1, "currentChunkSize": 1, "data": "***"
        }"#;
        assert!(serde_json::from_str::<SaveChunkRequest>(json).is_err());
    }

    #[test]
    fn admit_request_field_names() {
        let json = r#"{
            "uploadId": "u1", "fileName": "a.bin", "totalChunks": 2,
            "totalSize": 20, "chunkNumber": 1
        }"#;
        let req: AdmitChunkRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.total_chunks, 2);
        assert_eq!(req.chunk_number, 1);
    }

    #[test]
    fn progress_event_from_record() {
        let mut record = UploadRecord::new("u1", "a.bin", 4, 40, Utc::now());
        record.mark_chunk_present(1, None);
        let evt = UploadProgressEvent::from(&record);
        assert_eq!(evt.received_chunks, 1);
        assert_eq!(evt.total_chunks, 4);
        assert!((evt.percentage - 25.0).abs() < f64::EPSILON);
        assert!(!evt.upload_complete);
    }
}
