use thiserror::Error;

/// Errors returned by key-value store backends.
#[derive(Debug, Error)]
pub enum KvError {
    /// The requested key has no value.
    #[error("key not found: {}", String::from_utf8_lossy(.0))]
    KeyNotFound(Vec<u8>),

    /// Keys must contain at least one byte.
    #[error("empty key")]
    EmptyKey,

    /// The store was closed; no further operations are accepted.
    #[error("store is closed")]
    Closed,

    /// A persisted record could not be decoded.
    #[error("corrupt store data: {0}")]
    Corrupt(String),

    /// A lock guarding the in-memory index was poisoned by a panicking writer.
    #[error("lock poisoned: {0}")]
    Poisoned(String),

    /// A lower-level I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl KvError {
    /// Returns true if this error reports a missing key.
    pub fn is_not_found(&self) -> bool {
        matches!(self, KvError::KeyNotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_not_found_display() {
        let err = KvError::KeyNotFound(b"l/photos/cat.jpg".to_vec());
        assert_eq!(err.to_string(), "key not found: l/photos/cat.jpg");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_closed_is_not_not_found() {
        assert!(!KvError::Closed.is_not_found());
        assert_eq!(KvError::EmptyKey.to_string(), "empty key");
    }
}
