//! Depth journal: durable per-instrument capture of L2 market-depth
//! snapshots, a shared-memory ring for local fan-out, and timestamp-indexed
//! replay.
//!
//! - `record`: the fixed 1032-byte canonical record (64-byte header plus a
//!   30-level L2 payload) and its zero-copy view
//! - `journal` / `directory`: append-only writers and the per-instrument
//!   file registry (`{base}/{segment}/{token}/{yyyy-mm-dd}_{hh}.bin`)
//! - `replay`: memory-mapped loading, binary-search seek and ordered replay
//! - `ring`: single-producer mapped ring with release-ordered publishing
//! - `backend` / `native`: pluggable storage engine, including an optional
//!   native library bound at runtime
//! - `recorder`: ingestion pipeline tying the pieces together
//!
//! The binaries (`src/main.rs` and `src/bin/player.rs`) record JSON-lines
//! snapshots and replay the resulting journals.
pub mod backend;
pub mod book;
pub mod config;
pub mod directory;
pub mod error;
pub mod journal;
#[cfg(feature = "native-bridge")]
pub mod native;
pub mod record;
pub mod recorder;
pub mod replay;
pub mod ring;

pub use backend::{JournalBackend, JournalSink, PureBackend, select_backend};
pub use book::{BookLevel, BookSnapshot, InstrumentKey};
pub use config::{JournalConfig, NativeConfig, RingConfig};
pub use directory::{Clock, FixedClock, JournalDirectory, RotationPolicy, SystemClock};
pub use error::{JournalError, Result};
pub use journal::{Durability, JournalWriter, RecordMeta};
pub use record::{EventHeader, EventType, L2Payload, RECORD_SIZE, RecordView};
pub use recorder::{Recorder, RecorderStats, spawn_recorder};
pub use replay::{JournalMap, RecordRef, ReplayEngine};
pub use ring::{RingPublisher, RingReader};
