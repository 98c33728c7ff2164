//! Error type shared by the journal, replay, ring and backend modules.
//!
//! Directory-level writes deliberately do not surface these errors (they are
//! logged and the write is dropped); everything below that level returns
//! [`Result`].
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the journal subsystem.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JournalError {
    /// An I/O error while creating, writing, mapping or syncing a file.
    #[error("journal I/O error{}: {source}", at_path(.path))]
    Io {
        /// The file involved, if known.
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },

    /// Ring capacity is zero, the record length is zero, or the capacity is
    /// not an exact multiple of the record length.
    #[error("ring capacity {capacity} is not a non-zero multiple of record length {record_len}")]
    RingGeometry { capacity: u64, record_len: u64 },

    /// A record handed to the ring or a sink has the wrong length.
    #[error("record length mismatch: expected {expected} bytes, got {actual}")]
    RecordLength { expected: usize, actual: usize },

    /// An existing shared segment has a header that disagrees with its size.
    #[error("malformed ring segment {}: {message}", .path.display())]
    RingHeader { path: PathBuf, message: String },

    /// Another thread panicked while holding a writer or mapping lock.
    #[error("journal internal mutex poisoned")]
    MutexPoisoned,

    /// The native library could not be loaded.
    #[error("failed to load native journal library {}: {message}", .path.display())]
    NativeLoad { path: PathBuf, message: String },

    /// A required symbol is missing from the native library.
    #[error("native journal library is missing symbol {name}: {message}")]
    NativeSymbol { name: &'static str, message: String },

    /// The native library reports an ABI tag other than the one this crate
    /// was built against.
    #[error("native ABI mismatch: expected {expected:#010x}, found {found:#010x}")]
    AbiMismatch { expected: u32, found: u32 },

    /// A native call returned a null handle or otherwise failed.
    #[error("native journal call {op} failed")]
    NativeCall { op: &'static str },
}

impl JournalError {
    /// Attach a path to an I/O error.
    #[cold]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        JournalError::Io {
            path: Some(path.into()),
            source,
        }
    }
}

impl From<std::io::Error> for JournalError {
    #[cold]
    fn from(source: std::io::Error) -> Self {
        JournalError::Io { path: None, source }
    }
}

fn at_path(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| format!(" at {}", p.display()))
        .unwrap_or_default()
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, JournalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_display_includes_path() {
        let err = JournalError::io("/tmp/x.bin", std::io::Error::other("boom"));
        let s = err.to_string();
        assert!(s.contains("/tmp/x.bin"), "{s}");
        assert!(s.contains("boom"), "{s}");
    }

    #[test]
    fn io_error_without_path() {
        let err: JournalError = std::io::Error::other("boom").into();
        assert_eq!(err.to_string(), "journal I/O error: boom");
    }

    #[test]
    fn abi_mismatch_is_hex() {
        let err = JournalError::AbiMismatch {
            expected: 0xDEAD_1701,
            found: 0x1,
        };
        assert_eq!(
            err.to_string(),
            "native ABI mismatch: expected 0xdead1701, found 0x00000001"
        );
    }
}
