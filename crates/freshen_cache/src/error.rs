//! Error types for memoization and cache operations.

use std::path::PathBuf;

/// Errors that can occur while memoizing a call.
///
/// Storage failures are absorbed by the memoizers (a failed read is a miss,
/// a failed write still returns the computed value), so callers mostly see
/// `SourceUnavailable`, `Serialization` and `Function`.
#[derive(Debug, thiserror::Error)]
pub enum MemoError {
    /// The wrapped function's defining source text could not be retrieved.
    #[error("source unavailable for `{name}` ({path}): {reason}")]
    SourceUnavailable {
        /// Qualified name of the function.
        name: String,
        /// The source file that was consulted.
        path: PathBuf,
        /// Why the source could not be retrieved.
        reason: String,
    },

    /// A dependency's modification time could not be read.
    #[error("dependency {path} unreadable: {reason}")]
    DependencyUnreadable {
        /// The dependency path.
        path: PathBuf,
        /// Description of the metadata failure.
        reason: String,
    },

    /// An I/O error occurred while reading or writing a cache entry.
    #[error("cache I/O error at {path}: {source}")]
    Storage {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A cache entry header is missing, malformed, or from another format version.
    #[error("invalid entry header in {path}: {reason}")]
    InvalidHeader {
        /// The header file path.
        path: PathBuf,
        /// Description of the header problem.
        reason: String,
    },

    /// The payload checksum does not match the one recorded in the header.
    #[error("checksum mismatch in {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// The payload file path.
        path: PathBuf,
        /// The checksum recorded in the header.
        expected: String,
        /// The checksum computed from the payload.
        actual: String,
    },

    /// The injected serializer failed to encode or decode a value.
    #[error("serialization error: {0}")]
    Serialization(CodecError),

    /// The wrapped function itself returned an error.
    #[error("wrapped function failed: {0}")]
    Function(Box<dyn std::error::Error + Send + Sync>),
}

impl MemoError {
    /// Returns `true` for storage-layer failures that degrade to a recompute.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            MemoError::Storage { .. }
                | MemoError::InvalidHeader { .. }
                | MemoError::ChecksumMismatch { .. }
        )
    }

    pub(crate) fn storage(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| MemoError::Storage { path, source }
    }
}

/// Errors reported by serializer pairs.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The codec could not open, read, or write its file.
    #[error("codec I/O error at {path}: {source}")]
    Io {
        /// The payload location.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A value could not be encoded.
    #[error("failed to encode value: {reason}")]
    Encode {
        /// Description of the encoding failure.
        reason: String,
    },

    /// Stored bytes could not be decoded into a value.
    #[error("failed to decode {path}: {reason}")]
    Decode {
        /// The payload location.
        path: PathBuf,
        /// Description of the decoding failure.
        reason: String,
    },
}

impl CodecError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| CodecError::Io { path, source }
    }
}

/// Codec I/O failures are storage failures; everything else is a
/// serialization failure that must reach the caller.
impl From<CodecError> for MemoError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io { path, source } => MemoError::Storage { path, source },
            other => MemoError::Serialization(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_unavailable_display() {
        let err = MemoError::SourceUnavailable {
            name: "demo::f".to_string(),
            path: PathBuf::from("/src/demo.rs"),
            reason: "no definition of `f`".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("source unavailable"));
        assert!(msg.contains("demo::f"));
        assert!(msg.contains("no definition"));
    }

    #[test]
    fn storage_display() {
        let err = MemoError::Storage {
            path: PathBuf::from("/tmp/cache/entry.meta"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
        };
        let msg = err.to_string();
        assert!(msg.contains("cache I/O error"));
        assert!(msg.contains("entry.meta"));
        assert!(err.is_storage());
    }

    #[test]
    fn checksum_mismatch_display() {
        let err = MemoError::ChecksumMismatch {
            path: PathBuf::from("payload"),
            expected: "aabb".to_string(),
            actual: "ccdd".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("checksum mismatch"));
        assert!(msg.contains("aabb"));
        assert!(msg.contains("ccdd"));
    }

    #[test]
    fn codec_io_becomes_storage() {
        let err: MemoError = CodecError::Io {
            path: PathBuf::from("payload"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        }
        .into();
        assert!(matches!(err, MemoError::Storage { .. }));
    }

    #[test]
    fn codec_decode_becomes_serialization() {
        let err: MemoError = CodecError::Decode {
            path: PathBuf::from("payload"),
            reason: "unexpected end".to_string(),
        }
        .into();
        assert!(matches!(err, MemoError::Serialization(_)));
        assert!(!err.is_storage());
        assert!(err.to_string().contains("unexpected end"));
    }

    #[test]
    fn function_error_display() {
        let inner = std::io::Error::new(std::io::ErrorKind::NotFound, "input missing");
        let err = MemoError::Function(Box::new(inner));
        assert!(err.to_string().contains("wrapped function failed: input missing"));
    }
}
