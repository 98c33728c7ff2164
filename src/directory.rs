//! Per-instrument journal directory.
//!
//! [`JournalDirectory`] maps an instrument key (`SEGMENT|TOKEN`) to an open
//! journal sink, creating the file lazily on first write at
//!
//! ```text
//! {base_dir}/{segment}/{token}/{yyyy-mm-dd}_{hh}.bin
//! ```
//!
//! using the UTC date and hour at creation time. Distinct keys can be written
//! from different threads at once; writes to the same key are serialized by
//! the sink's mutex.
//!
//! If a file cannot be created the key is marked failed: the error is logged
//! once and later writes for that key are dropped instead of being retried,
//! so one bad instrument never stalls the others.
use crate::backend::{JournalBackend, JournalSink, PureBackend, select_backend};
use crate::book::{BookSnapshot, InstrumentKey};
use crate::config::JournalConfig;
use crate::error::{JournalError, Result};
use crate::journal::RecordMeta;
use crate::record::L2Payload;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use tracing::{error, info, warn};

/// A cached sink shared between the directory and callers.
pub type SharedSink = Arc<Mutex<Box<dyn JournalSink>>>;

/// Source of "now" for file naming.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Manually driven clock for deterministic file naming.
#[derive(Debug)]
pub struct FixedClock(Mutex<OffsetDateTime>);

impl FixedClock {
    pub fn new(at: OffsetDateTime) -> Self {
        Self(Mutex::new(at))
    }

    pub fn set(&self, at: OffsetDateTime) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: time::Duration) {
        let mut now = self.0.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now_utc(&self) -> OffsetDateTime {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// When an already-open writer moves to a new file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationPolicy {
    /// The file name is fixed at first write for the life of the directory;
    /// a new hour only takes effect after a restart.
    #[default]
    Never,
    /// Every write re-derives the file name and switches files when the UTC
    /// date or hour changed. Sequences restart at 1 in the new file.
    Hourly,
}

impl FromStr for RotationPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "never" | "none" => Ok(RotationPolicy::Never),
            "hourly" | "hour" => Ok(RotationPolicy::Hourly),
            other => Err(format!("unknown rotation policy '{other}' (expected 'never' or 'hourly')")),
        }
    }
}

#[derive(Clone)]
enum WriterState {
    Open(SharedSink),
    Failed,
}

/// Owned registry of per-instrument journal sinks.
pub struct JournalDirectory {
    base_dir: PathBuf,
    rotation: RotationPolicy,
    backend: Arc<dyn JournalBackend>,
    clock: Arc<dyn Clock>,
    writers: DashMap<String, WriterState>,
}

impl JournalDirectory {
    /// Directory under `base_dir` using the pure backend and the system clock.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            rotation: RotationPolicy::Never,
            backend: Arc::new(PureBackend::default()),
            clock: Arc::new(SystemClock),
            writers: DashMap::new(),
        }
    }

    /// Directory with the backend `config` selects: the native engine when
    /// one is configured (failing if it cannot be bound), the pure backend
    /// otherwise.
    pub fn from_config(config: &JournalConfig) -> Result<Self> {
        let backend = select_backend(config.native.as_ref(), config.durability)?;
        Ok(Self::new(&config.base_dir)
            .with_rotation(config.rotation)
            .with_backend(backend))
    }

    pub fn with_rotation(mut self, rotation: RotationPolicy) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn JournalBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn rotation(&self) -> RotationPolicy {
        self.rotation
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Journal path for `instrument_key` at instant `at`.
    pub fn path_for(&self, instrument_key: &str, at: OffsetDateTime) -> PathBuf {
        let key = InstrumentKey::parse(instrument_key);
        let fname = format!(
            "{}-{:02}-{:02}_{:02}.bin",
            at.year(),
            at.month() as u8,
            at.day(),
            at.hour()
        );
        let mut p = self.base_dir.join(key.segment);
        p.push(key.token);
        p.push(fname);
        p
    }

    /// Cached sink for `instrument_key`, creating directories and the file on
    /// first use. Returns `None` when the key's file could not be created,
    /// now or on an earlier call.
    pub fn get_or_create_writer(&self, instrument_key: &str) -> Option<SharedSink> {
        if let Some(state) = self.writers.get(instrument_key) {
            return state.sink();
        }
        self.writers
            .entry(instrument_key.to_string())
            .or_insert_with(|| self.create_state(instrument_key))
            .sink()
    }

    fn create_state(&self, instrument_key: &str) -> WriterState {
        let path = self.path_for(instrument_key, self.clock.now_utc());
        match self.open_sink(&path) {
            Ok(sink) => {
                info!(instrument_key, path = %path.display(), backend = self.backend.name(), "opened journal");
                WriterState::Open(Arc::new(Mutex::new(sink)))
            }
            Err(e) => {
                error!(instrument_key, path = %path.display(), error = %e, "failed to create journal writer; dropping writes for this instrument");
                WriterState::Failed
            }
        }
    }

    fn open_sink(&self, path: &Path) -> Result<Box<dyn JournalSink>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| JournalError::io(parent, e))?;
        }
        self.backend.open_sink(path)
    }

    /// Append one record for `instrument_key`. Failures are logged and
    /// swallowed; the assigned sequence is returned on success.
    pub fn append(&self, instrument_key: &str, meta: &RecordMeta, payload: &L2Payload) -> Option<u64> {
        let Some(shared) = self.get_or_create_writer(instrument_key) else {
            warn!(instrument_key, "journal writer unavailable; write dropped");
            return None;
        };
        let Ok(mut sink) = shared.lock() else {
            error!(instrument_key, "journal writer lock poisoned; write dropped");
            return None;
        };
        if self.rotation == RotationPolicy::Hourly {
            self.rotate_if_due(instrument_key, &mut sink);
        }
        match sink.append(meta, payload) {
            Ok(seq) => Some(seq),
            Err(e) => {
                error!(instrument_key, error = %e, "journal write failed");
                None
            }
        }
    }

    /// Journal an order book snapshot, deriving the instrument id from the
    /// key's numeric token (0 if it is not numeric).
    pub fn write_snapshot(&self, snapshot: &BookSnapshot) -> Option<u64> {
        let key = InstrumentKey::parse(&snapshot.instrument_key);
        let meta = RecordMeta::l2(snapshot.exchange_ts, snapshot.receive_ts, key.instrument_id());
        self.append(&snapshot.instrument_key, &meta, &L2Payload::from_book(snapshot))
    }

    fn rotate_if_due(&self, instrument_key: &str, sink: &mut Box<dyn JournalSink>) {
        let path = self.path_for(instrument_key, self.clock.now_utc());
        if sink.path() == path {
            return;
        }
        match self.open_sink(&path) {
            Ok(next) => {
                let prev = std::mem::replace(sink, next);
                info!(instrument_key, from = %prev.path().display(), to = %path.display(), "rotated journal");
                if let Err(e) = prev.close() {
                    warn!(instrument_key, error = %e, "error closing rotated journal");
                }
            }
            Err(e) => {
                error!(instrument_key, path = %path.display(), error = %e, "journal rotation failed; keeping current file");
            }
        }
    }

    /// Keys with a cached entry, including failed ones.
    pub fn instrument_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.writers.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.writers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }

    /// Whether `instrument_key` was marked failed.
    pub fn is_failed(&self, instrument_key: &str) -> bool {
        matches!(
            self.writers.get(instrument_key).as_deref(),
            Some(WriterState::Failed)
        )
    }

    pub fn flush_all(&self) -> Result<()> {
        self.for_each_open(|sink| sink.flush())
    }

    /// `fdatasync` every open journal.
    pub fn sync_all(&self) -> Result<()> {
        self.for_each_open(|sink| sink.sync())
    }

    /// Visit every open sink, returning the first error after all were tried.
    fn for_each_open(&self, mut f: impl FnMut(&mut Box<dyn JournalSink>) -> Result<()>) -> Result<()> {
        let mut first_err = None;
        for entry in self.writers.iter() {
            let WriterState::Open(shared) = entry.value() else { continue };
            let outcome = match shared.lock() {
                Ok(mut sink) => f(&mut sink),
                Err(_) => Err(JournalError::MutexPoisoned),
            };
            if let Err(e) = outcome {
                warn!(instrument_key = %entry.key(), error = %e, "journal flush failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Flush and close every cached writer and forget all keys, including
    /// failed ones. Returns the number of writers closed.
    pub fn close_all(&self) -> usize {
        let keys: Vec<String> = self.writers.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0usize;
        for key in keys {
            let Some((_, WriterState::Open(shared))) = self.writers.remove(&key) else { continue };
            match Arc::try_unwrap(shared) {
                Ok(mutex) => {
                    let sink = mutex.into_inner().unwrap_or_else(|e| e.into_inner());
                    if let Err(e) = sink.close() {
                        warn!(instrument_key = %key, error = %e, "error closing journal");
                    }
                }
                Err(shared) => {
                    // Still held by a caller: flush now, the file closes when
                    // the last handle drops.
                    if let Ok(mut sink) = shared.lock() {
                        if let Err(e) = sink.flush() {
                            warn!(instrument_key = %key, error = %e, "error flushing journal");
                        }
                    }
                }
            }
            closed += 1;
        }
        info!(closed, "closed journal writers");
        closed
    }
}

impl WriterState {
    fn sink(&self) -> Option<SharedSink> {
        match self {
            WriterState::Open(s) => Some(Arc::clone(s)),
            WriterState::Failed => None,
        }
    }
}

impl Drop for JournalDirectory {
    fn drop(&mut self) {
        if !self.writers.is_empty() {
            self.close_all();
        }
    }
}

impl std::fmt::Debug for JournalDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalDirectory")
            .field("base_dir", &self.base_dir)
            .field("rotation", &self.rotation)
            .field("backend", &self.backend.name())
            .field("writers", &self.writers.len())
            .finish()
    }
}
