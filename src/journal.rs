//! Append-only journal writer for one instrument file.
//!
//! Each [`JournalWriter::write`] encodes one canonical record into a reused
//! scratch buffer and appends it with a single `write_all`, so the file grows
//! by exactly [`RECORD_SIZE`] bytes per call. Sequence numbers are assigned
//! per writer, starting at 1.
//!
//! The writer takes `&mut self` for every mutation; sharing one across
//! threads requires external locking (the directory wraps each writer in a
//! mutex).
use crate::book::BookSnapshot;
use crate::error::{JournalError, Result};
use crate::record::{EventHeader, EventType, L2Payload, PAYLOAD_SIZE, RECORD_SIZE, encode_into};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

/// How hard a write pushes bytes towards the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// Rely on the OS page cache; a crash of the machine may lose the tail.
    #[default]
    OsBuffered,
    /// `fdatasync` after every record.
    SyncData,
}

impl FromStr for Durability {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "os" | "buffered" | "os-buffered" => Ok(Durability::OsBuffered),
            "sync" | "sync-data" | "fsync" => Ok(Durability::SyncData),
            other => Err(format!("unknown durability '{other}' (expected 'buffered' or 'sync')")),
        }
    }
}

/// Header fields supplied by the caller; the writer fills in the sequence
/// and payload size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMeta {
    pub exchange_ts: u64,
    pub receive_ts: u64,
    pub instrument_id: u32,
    pub event_type: u16,
}

impl RecordMeta {
    pub fn l2(exchange_ts: u64, receive_ts: u64, instrument_id: u32) -> Self {
        Self {
            exchange_ts,
            receive_ts,
            instrument_id,
            event_type: EventType::L2Snapshot as u16,
        }
    }

    /// Full header for a record stamped with `sequence`.
    pub fn header(&self, sequence: u64) -> EventHeader {
        EventHeader {
            sequence,
            exchange_ts: self.exchange_ts,
            receive_ts: self.receive_ts,
            instrument_id: self.instrument_id,
            event_type: self.event_type,
            payload_size: PAYLOAD_SIZE as u16,
            source: 0,
            flags: 0,
        }
    }
}

pub struct JournalWriter {
    file: File,
    path: PathBuf,
    sequence: u64,
    /// Bytes known to hold whole records.
    committed_len: u64,
    durability: Durability,
    scratch: Box<[u8; RECORD_SIZE]>,
}

impl JournalWriter {
    /// Open `path` in create+append mode.
    ///
    /// A pre-existing file whose length is not a whole number of records
    /// (a torn write from a previous run) is cut back to the last record
    /// boundary so new records stay aligned.
    pub fn open(path: impl AsRef<Path>, durability: Durability) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| JournalError::io(&path, e))?;

        let len = file.metadata().map_err(|e| JournalError::io(&path, e))?.len();
        let aligned = len - len % RECORD_SIZE as u64;
        if aligned != len {
            warn!(
                path = %path.display(),
                stray_bytes = len - aligned,
                "journal ends with a partial record; truncating to record boundary"
            );
            file.set_len(aligned).map_err(|e| JournalError::io(&path, e))?;
        }

        Ok(Self {
            file,
            path,
            sequence: 0,
            committed_len: aligned,
            durability,
            scratch: Box::new([0u8; RECORD_SIZE]),
        })
    }

    /// Append one record and return the sequence number assigned to it.
    ///
    /// The sequence is consumed even when the write fails, so a number is
    /// never handed out twice by the same writer.
    pub fn write(&mut self, meta: &RecordMeta, payload: &L2Payload) -> Result<u64> {
        self.sequence += 1;
        let sequence = self.sequence;
        encode_into(&meta.header(sequence), payload, &mut self.scratch);

        if let Err(e) = self.file.write_all(&self.scratch[..]) {
            // Best effort: drop a torn record so later appends stay aligned.
            if let Err(rollback) = self.file.set_len(self.committed_len) {
                warn!(
                    path = %self.path.display(),
                    sequence,
                    error = %rollback,
                    "could not roll back failed append; journal may end with a partial record"
                );
            }
            return Err(JournalError::io(&self.path, e));
        }
        self.committed_len += RECORD_SIZE as u64;

        if self.durability == Durability::SyncData {
            self.sync()?;
        }
        Ok(sequence)
    }

    /// Encode and append an L2 snapshot.
    pub fn write_book(&mut self, book: &BookSnapshot, instrument_id: u32) -> Result<u64> {
        let meta = RecordMeta::l2(book.exchange_ts, book.receive_ts, instrument_id);
        self.write(&meta, &L2Payload::from_book(book))
    }

    /// The bytes of the most recently encoded record.
    pub fn last_record(&self) -> &[u8; RECORD_SIZE] {
        &self.scratch
    }

    /// Last sequence number handed out (0 before the first write).
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn durability(&self) -> Durability {
        self.durability
    }

    /// Bytes of whole records in the file, including those present before
    /// this writer opened it.
    pub fn len_bytes(&self) -> u64 {
        self.committed_len
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush().map_err(|e| JournalError::io(&self.path, e))
    }

    /// Force written records to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| JournalError::io(&self.path, e))
    }

    /// Flush and release the file handle.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}

impl std::fmt::Debug for JournalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalWriter")
            .field("path", &self.path)
            .field("sequence", &self.sequence)
            .field("len_bytes", &self.committed_len)
            .field("durability", &self.durability)
            .finish()
    }
}
