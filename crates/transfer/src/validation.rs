use crate::TransferError;

/// Longest accepted storage key.
const MAX_KEY_LEN: usize = 128;

/// Validates that a transfer id is safe to use as a backing file name.
///
/// Transfer ids come from the remote peer, so they are restricted to ASCII
/// alphanumerics, `-`, `_` and `.`, and may not be `.` or `..`.
pub fn validate_storage_key(key: &str) -> Result<(), TransferError> {
    if key.is_empty() {
        return Err(TransferError::InvalidKey("empty key".into()));
    }

    if key.len() > MAX_KEY_LEN {
        return Err(TransferError::InvalidKey(format!(
            "key longer than {MAX_KEY_LEN} bytes"
        )));
    }

    if key == "." || key == ".." {
        return Err(TransferError::InvalidKey(format!(
            "reserved name not allowed: {key}"
        )));
    }

    if let Some(c) = key
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(TransferError::InvalidKey(format!(
            "character {c:?} not allowed in {key}"
        )));
    }

    Ok(())
}
