//! Pluggable journal backends.
//!
//! The directory talks to storage only through [`JournalBackend`] and the
//! [`JournalSink`]s it opens. [`PureBackend`] is the in-crate implementation
//! (append-mode file writer plus memory-mapped seek). A native engine can be
//! bound instead at startup; see [`select_backend`].
use crate::config::NativeConfig;
use crate::error::Result;
use crate::journal::{Durability, JournalWriter, RecordMeta};
use crate::record::L2Payload;
use crate::replay::JournalMap;
use std::path::Path;
use std::sync::Arc;

/// Append side of one open journal file.
pub trait JournalSink: Send {
    /// Append one record, returning the sequence assigned to it.
    fn append(&mut self, meta: &RecordMeta, payload: &L2Payload) -> Result<u64>;

    /// Last sequence handed out (0 before the first append).
    fn sequence(&self) -> u64;

    fn path(&self) -> &Path;

    fn flush(&mut self) -> Result<()>;

    fn sync(&mut self) -> Result<()>;

    /// Flush and release the underlying file.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Storage engine selected once at startup.
pub trait JournalBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open (create or append to) the journal at `path`. Parent directories
    /// already exist.
    fn open_sink(&self, path: &Path) -> Result<Box<dyn JournalSink>>;

    /// Byte offset of the first record in `path` whose exchange timestamp is
    /// at least `target_ts`, or `None` if there is none.
    fn seek(&self, path: &Path, target_ts: u64) -> Result<Option<u64>>;
}

impl JournalSink for JournalWriter {
    fn append(&mut self, meta: &RecordMeta, payload: &L2Payload) -> Result<u64> {
        self.write(meta, payload)
    }

    fn sequence(&self) -> u64 {
        JournalWriter::sequence(self)
    }

    fn path(&self) -> &Path {
        JournalWriter::path(self)
    }

    fn flush(&mut self) -> Result<()> {
        JournalWriter::flush(self)
    }

    fn sync(&mut self) -> Result<()> {
        JournalWriter::sync(self)
    }

    fn close(self: Box<Self>) -> Result<()> {
        JournalWriter::close(*self)
    }
}

/// Default backend: [`JournalWriter`] for appends, [`JournalMap`] for seeks.
#[derive(Debug, Clone, Copy, Default)]
pub struct PureBackend {
    durability: Durability,
}

impl PureBackend {
    pub fn new(durability: Durability) -> Self {
        Self { durability }
    }
}

impl JournalBackend for PureBackend {
    fn name(&self) -> &'static str {
        "pure"
    }

    fn open_sink(&self, path: &Path) -> Result<Box<dyn JournalSink>> {
        Ok(Box::new(JournalWriter::open(path, self.durability)?))
    }

    fn seek(&self, path: &Path, target_ts: u64) -> Result<Option<u64>> {
        let map = JournalMap::open(path)?;
        Ok(map.seek_by_timestamp(target_ts).map(|r| r.offset() as u64))
    }
}

/// Pick the backend for this process: the native engine when `native` is
/// configured (failing hard if it cannot be bound or its ABI tag does not
/// match), the pure backend otherwise.
pub fn select_backend(
    native: Option<&NativeConfig>,
    durability: Durability,
) -> Result<Arc<dyn JournalBackend>> {
    match native {
        None => Ok(Arc::new(PureBackend::new(durability))),
        #[cfg(feature = "native-bridge")]
        Some(cfg) => Ok(Arc::new(crate::native::NativeBackend::load(
            &cfg.library,
            cfg.writer_capacity,
        )?)),
        #[cfg(not(feature = "native-bridge"))]
        Some(cfg) => Err(crate::error::JournalError::NativeLoad {
            path: cfg.library.clone(),
            message: "built without the `native-bridge` feature".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::{BookLevel, BookSnapshot};
    use crate::record::RECORD_SIZE;

    #[test]
    fn pure_backend_round_trip_through_trait_objects() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("j.bin");
        let backend = select_backend(None, Durability::OsBuffered).unwrap();
        assert_eq!(backend.name(), "pure");

        let mut sink = backend.open_sink(&path).unwrap();
        for ts in [100u64, 200, 200, 300] {
            let book = BookSnapshot::new("NSE_FO|5", ts, ts)
                .with_levels(vec![BookLevel::new(1.5, 1)], vec![]);
            sink.append(&RecordMeta::l2(ts, ts, 5), &L2Payload::from_book(&book))
                .unwrap();
        }
        assert_eq!(sink.sequence(), 4);
        sink.sync().unwrap();
        sink.close().unwrap();

        assert_eq!(backend.seek(&path, 150).unwrap(), Some(RECORD_SIZE as u64));
        assert_eq!(backend.seek(&path, 0).unwrap(), Some(0));
        assert_eq!(backend.seek(&path, 1000).unwrap(), None);
    }

    #[test]
    fn seek_on_missing_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = PureBackend::default();
        assert!(backend.seek(&tmp.path().join("missing.bin"), 1).is_err());
    }

    #[cfg(feature = "native-bridge")]
    #[test]
    fn missing_native_library_fails_hard() {
        let cfg = NativeConfig::new("/nonexistent/libmarket_data_core.so");
        let err = select_backend(Some(&cfg), Durability::OsBuffered)
            .err()
            .expect("loading a missing library must fail");
        assert!(matches!(err, crate::error::JournalError::NativeLoad { .. }));
    }
}
