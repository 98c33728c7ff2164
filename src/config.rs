//! Runtime configuration for the journal directory, the shared ring and the
//! optional native backend.
//!
//! The binaries fill these from `clap` arguments (with `.env`/environment
//! fallbacks); library users construct them directly.
use crate::directory::RotationPolicy;
use crate::journal::Durability;
use crate::record::RECORD_SIZE;
use std::path::PathBuf;

pub const DEFAULT_BASE_DIR: &str = "database/marketdata_raw";
pub const DEFAULT_RING_PATH: &str = "market_data_shm.bin";
/// Nominal ring size (64 MiB) before rounding down to whole records.
pub const DEFAULT_RING_BYTES: u64 = 64 * 1024 * 1024;
/// Pre-allocated size of a native writer's mapping (1 GiB).
pub const DEFAULT_NATIVE_CAPACITY: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingConfig {
    pub path: PathBuf,
    /// Bytes of ring data, excluding the 16-byte header.
    pub capacity: u64,
    pub record_len: u64,
}

impl RingConfig {
    /// Ring of `slots` canonical records.
    pub fn with_slots(path: impl Into<PathBuf>, slots: u64) -> Self {
        Self {
            path: path.into(),
            capacity: slots * RECORD_SIZE as u64,
            record_len: RECORD_SIZE as u64,
        }
    }

    /// Largest whole-record ring that fits in `bytes`.
    pub fn fitting(path: impl Into<PathBuf>, bytes: u64) -> Self {
        Self::with_slots(path, bytes / RECORD_SIZE as u64)
    }

    pub fn slots(&self) -> u64 {
        if self.record_len == 0 {
            0
        } else {
            self.capacity / self.record_len
        }
    }
}

impl Default for RingConfig {
    fn default() -> Self {
        Self::fitting(DEFAULT_RING_PATH, DEFAULT_RING_BYTES)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeConfig {
    /// Path to the shared library exporting the `mdc_*` symbols.
    pub library: PathBuf,
    pub writer_capacity: u64,
}

impl NativeConfig {
    pub fn new(library: impl Into<PathBuf>) -> Self {
        Self {
            library: library.into(),
            writer_capacity: DEFAULT_NATIVE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalConfig {
    pub base_dir: PathBuf,
    pub rotation: RotationPolicy,
    pub durability: Durability,
    pub ring: Option<RingConfig>,
    pub native: Option<NativeConfig>,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from(DEFAULT_BASE_DIR),
            rotation: RotationPolicy::default(),
            durability: Durability::default(),
            ring: None,
            native: None,
        }
    }
}
