//! Binary chunk frames: 4-byte big-endian header length + JSON header + raw payload.

use serde::{Deserialize, Serialize};

/// Header of a binary `save_chunk` frame.
///
/// Carries the same fields as a JSON `save_chunk` request, minus the
/// base64 data which follows the header as raw bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryChunkHeader {
    /// Request id echoed in the reply.
    pub id: String,
    pub upload_id: String,
    pub file_name: String,
    pub total_chunks: u32,
    pub total_size: u64,
    pub chunk_number: u32,
    pub current_chunk_size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
}

/// Parses a raw binary WebSocket frame into its header and payload.
///
/// Wire format: `[4 bytes: header_len (big-endian)][header_len bytes: JSON][rest: payload]`
pub fn parse_binary_message(data: &[u8]) -> Result<(BinaryChunkHeader, Vec<u8>), ParseError> {
    let (header_bytes, payload) = split_frame(data)?;
    let header: BinaryChunkHeader = serde_json::from_slice(header_bytes)
        .map_err(|e| ParseError::InvalidJson(e.to_string()))?;
    Ok((header, payload.to_vec()))
}

/// Extracts the request id from a frame whose header failed to parse, so
/// the error can still be correlated by the client.
pub(crate) fn peek_message_id(data: &[u8]) -> Option<String> {
    let (header_bytes, _) = split_frame(data).ok()?;
    serde_json::from_slice::<IdPeek>(header_bytes).ok()?.id
}

fn split_frame(data: &[u8]) -> Result<(&[u8], &[u8]), ParseError> {
    if data.len() < 4 {
        return Err(ParseError::TooShort);
    }

    let header_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if data.len() - 4 < header_len {
        return Err(ParseError::HeaderTruncated {
            expected: header_len,
            got: data.len() - 4,
        });
    }

    Ok(data[4..].split_at(header_len))
}

/// Encodes a binary chunk frame for sending over WebSocket.
pub fn encode_binary_message<T: Serialize>(
    header: &T,
    payload: &[u8],
) -> Result<Vec<u8>, serde_json::Error> {
    let header_json = serde_json::to_vec(header)?;
    let header_len = header_json.len() as u32;

    let mut buf = Vec::with_capacity(4 + header_json.len() + payload.len());
    buf.extend_from_slice(&header_len.to_be_bytes());
    buf.extend_from_slice(&header_json);
    buf.extend_from_slice(payload);
    Ok(buf)
}

#[derive(Deserialize)]
struct IdPeek {
    id: Option<String>,
}

/// Errors from binary message parsing.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("message too short (need at least 4 bytes)")]
    TooShort,

    #[error("header truncated: expected {expected} bytes, got {got}")]
    HeaderTruncated { expected: usize, got: usize },

    #[error("invalid header JSON: {0}")]
    InvalidJson(String),
}
