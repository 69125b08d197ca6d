use crate::TransferError;

/// Longest identifier accepted.
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Longest original file name accepted, in bytes.
pub const MAX_FILE_NAME_LEN: usize = 255;

/// Validates that an upload identifier is safe to use as a file name.
///
/// Accepts 1 to [`MAX_IDENTIFIER_LEN`] characters drawn from ASCII
/// alphanumerics, `-` and `_`. This rules out separators, `.` and `..`,
/// so an identifier can never escape the storage directory or alias a
/// staging directory name.
pub fn validate_identifier(id: &str) -> Result<(), TransferError> {
    if id.is_empty() {
        return Err(TransferError::InvalidIdentifier("empty identifier".into()));
    }
    if id.len() > MAX_IDENTIFIER_LEN {
        return Err(TransferError::InvalidIdentifier(format!(
            "identifier longer than {MAX_IDENTIFIER_LEN} characters"
        )));
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(TransferError::InvalidIdentifier(format!(
            "character {c:?} not allowed in {id:?}"
        )));
    }
    Ok(())
}

/// Checks that a 1-based chunk number lies within `1..=total_chunks`.
pub fn check_chunk_index(chunk: u32, total_chunks: u32) -> Result<(), TransferError> {
    if chunk == 0 || chunk > total_chunks {
        return Err(TransferError::InvalidChunkIndex {
            chunk,
            total_chunks,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_uuid() {
        assert!(validate_identifier("3f2b8c1e-9a4d-4c5e-8f00-1234567890ab").is_ok());
    }

    #[test]
    fn accepts_short_ids() {
        assert!(validate_identifier("u1").is_ok());
        assert!(validate_identifier("upload_2").is_ok());
    }

    #[test]
    fn rejects_empty() {
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn rejects_traversal() {
        assert!(validate_identifier("..").is_err());
        assert!(validate_identifier("../etc").is_err());
        assert!(validate_identifier("a/b").is_err());
        assert!(validate_identifier("a\\b").is_err());
    }

    #[test]
    fn rejects_dots() {
        assert!(validate_identifier("u1.chunk").is_err());
    }

    #[test]
    fn rejects_overlong() {
        let id = "a".repeat(MAX_IDENTIFIER_LEN + 1);
        assert!(validate_identifier(&id).is_err());
        assert!(validate_identifier(&id[1..]).is_ok());
    }

    #[test]
    fn chunk_bounds() {
        assert!(check_chunk_index(1, 2).is_ok());
        assert!(check_chunk_index(2, 2).is_ok());
        assert!(matches!(
            check_chunk_index(0, 2),
            Err(TransferError::InvalidChunkIndex { chunk: 0, .. })
        ));
        assert!(check_chunk_index(3, 2).is_err());
    }
}
