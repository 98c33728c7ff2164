//! Memory-mapped, read-only journal replay.
//!
//! A [`JournalMap`] maps a whole journal file once and hands out
//! [`RecordRef`]s that point straight into the mapping; nothing is copied to
//! the heap while scanning. Records are fixed-width, so record `i` lives at
//! byte `i * RECORD_SIZE`. Bytes after the last whole record (a torn final
//! write) are ignored and never reported as an error.
//!
//! [`ReplayEngine`] owns the "currently loaded" map. Loading swaps it under
//! a mutex; readers keep their own `Arc` so a swap never invalidates a scan
//! in progress, and the old mapping is released when its last reader drops.
use crate::error::{JournalError, Result};
use crate::record::{RECORD_SIZE, RecordView};
use memmap2::Mmap;
use std::fs::File;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// A record inside a loaded journal, with its position.
#[derive(Debug, Clone, Copy)]
pub struct RecordRef<'a> {
    index: usize,
    view: RecordView<'a>,
}

impl<'a> RecordRef<'a> {
    /// Zero-based record index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Byte offset of the record within the file.
    pub fn offset(&self) -> usize {
        self.index * RECORD_SIZE
    }

    pub fn view(&self) -> RecordView<'a> {
        self.view
    }
}

impl<'a> Deref for RecordRef<'a> {
    type Target = RecordView<'a>;

    fn deref(&self) -> &Self::Target {
        &self.view
    }
}

/// An immutable mapping of one journal file.
pub struct JournalMap {
    path: PathBuf,
    /// `None` for an empty file, which cannot be mapped portably.
    mmap: Option<Mmap>,
}

impl JournalMap {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| JournalError::io(&path, e))?;
        let len = file.metadata().map_err(|e| JournalError::io(&path, e))?.len();
        let mmap = if len == 0 {
            None
        } else {
            // SAFETY: read-only mapping. Journal writers only ever append, so
            // the mapped prefix is never shrunk or rewritten while mapped;
            // bytes appended later are simply outside this mapping.
            Some(unsafe { Mmap::map(&file) }.map_err(|e| JournalError::io(&path, e))?)
        };
        debug!(path = %path.display(), bytes = len, "mapped journal");
        Ok(Self { path, mmap })
    }

    fn bytes(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn byte_len(&self) -> usize {
        self.bytes().len()
    }

    /// Number of whole records.
    pub fn record_count(&self) -> usize {
        self.byte_len() / RECORD_SIZE
    }

    /// Bytes past the last whole record.
    pub fn trailing_bytes(&self) -> usize {
        self.byte_len() % RECORD_SIZE
    }

    pub fn record(&self, index: usize) -> Option<RecordRef<'_>> {
        let start = index.checked_mul(RECORD_SIZE)?;
        let view = RecordView::new(self.bytes().get(start..)?)?;
        Some(RecordRef { index, view })
    }

    /// Record containing byte `offset` (rounded down to a record boundary).
    pub fn record_at(&self, offset: usize) -> Option<RecordRef<'_>> {
        self.record(offset / RECORD_SIZE)
    }

    /// First record with `exchange_ts >= target_ts`.
    ///
    /// Binary search over record indices; relies on exchange timestamps being
    /// non-decreasing within the file, which producers guarantee. With equal
    /// timestamps the earliest such record is returned.
    pub fn seek_by_timestamp(&self, target_ts: u64) -> Option<RecordRef<'_>> {
        let (mut lo, mut hi) = (0usize, self.record_count());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let ts = self.record(mid)?.exchange_ts();
            if ts < target_ts {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        self.record(lo)
    }

    /// Forward scan equivalent of [`seek_by_timestamp`](Self::seek_by_timestamp)
    /// that makes no ordering assumption.
    pub fn seek_by_timestamp_linear(&self, target_ts: u64) -> Option<RecordRef<'_>> {
        self.iter_from(0).find(|r| r.exchange_ts() >= target_ts)
    }

    /// Records from byte `offset` (rounded down to a boundary) to the end.
    pub fn iter_from(&self, offset: usize) -> Records<'_> {
        Records {
            map: self,
            next: offset / RECORD_SIZE,
            end: self.record_count(),
        }
    }

    /// Feed every whole record from `from` (a byte offset, rounded down; file
    /// start if `None`) to `sink`. Returns the number of records delivered.
    pub fn replay<F>(&self, from: Option<usize>, mut sink: F) -> usize
    where
        F: FnMut(RecordRef<'_>),
    {
        let mut n = 0usize;
        for record in self.iter_from(from.unwrap_or(0)) {
            sink(record);
            n += 1;
        }
        n
    }

    /// Replay starting at the first record with `exchange_ts >= target_ts`.
    /// Delivers nothing if no record qualifies.
    pub fn replay_from_timestamp<F>(&self, target_ts: u64, sink: F) -> usize
    where
        F: FnMut(RecordRef<'_>),
    {
        match self.seek_by_timestamp(target_ts) {
            Some(start) => self.replay(Some(start.offset()), sink),
            None => 0,
        }
    }
}

impl std::fmt::Debug for JournalMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalMap")
            .field("path", &self.path)
            .field("records", &self.record_count())
            .field("trailing_bytes", &self.trailing_bytes())
            .finish()
    }
}

/// Iterator over the records of a [`JournalMap`].
#[derive(Debug, Clone)]
pub struct Records<'a> {
    map: &'a JournalMap,
    next: usize,
    end: usize,
}

impl<'a> Iterator for Records<'a> {
    type Item = RecordRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let record = self.map.record(self.next)?;
        self.next += 1;
        Some(record)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.end.saturating_sub(self.next);
        (n, Some(n))
    }
}

impl ExactSizeIterator for Records<'_> {}

/// Holder of the currently loaded journal.
#[derive(Debug, Default)]
pub struct ReplayEngine {
    current: Mutex<Option<Arc<JournalMap>>>,
}

impl ReplayEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `path` and make it the current journal, replacing (and releasing
    /// this engine's hold on) any previous one. Concurrent loads are
    /// serialized.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Arc<JournalMap>> {
        let mut current = self.current.lock().map_err(|_| JournalError::MutexPoisoned)?;
        let map = Arc::new(JournalMap::open(path)?);
        *current = Some(Arc::clone(&map));
        Ok(map)
    }

    /// The loaded journal, if any.
    pub fn current(&self) -> Option<Arc<JournalMap>> {
        self.current.lock().ok().and_then(|g| g.clone())
    }

    /// Release the current journal. Returns whether one was loaded.
    pub fn close(&self) -> Result<bool> {
        let mut current = self.current.lock().map_err(|_| JournalError::MutexPoisoned)?;
        Ok(current.take().is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{EventHeader, L2Payload, encode};
    use std::io::Write;

    fn write_journal(path: &Path, timestamps: &[u64]) {
        let mut f = File::create(path).unwrap();
        for (i, ts) in timestamps.iter().enumerate() {
            let h = EventHeader::l2_snapshot(i as u64 + 1, *ts, ts + 1, 12345);
            f.write_all(&encode(&h, &L2Payload::default())).unwrap();
        }
    }

    #[test]
    fn seek_returns_first_record_at_or_after_target() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("j.bin");
        write_journal(&path, &[100, 200, 200, 300]);
        let map = JournalMap::open(&path).unwrap();

        let hit = map.seek_by_timestamp(150).unwrap();
        assert_eq!(hit.exchange_ts(), 200);
        assert_eq!(hit.index(), 1);
        assert_eq!(hit.offset(), RECORD_SIZE);
        assert_eq!(hit.sequence(), 2);

        assert_eq!(map.seek_by_timestamp(200).unwrap().index(), 1);
        assert_eq!(map.seek_by_timestamp(0).unwrap().index(), 0);
        assert_eq!(map.seek_by_timestamp(300).unwrap().index(), 3);
        assert!(map.seek_by_timestamp(1000).is_none());
        assert!(map.seek_by_timestamp(301).is_none());

        for target in [0, 100, 150, 200, 250, 300, 1000] {
            assert_eq!(
                map.seek_by_timestamp(target).map(|r| r.index()),
                map.seek_by_timestamp_linear(target).map(|r| r.index()),
                "target {target}"
            );
        }
    }

    #[test]
    fn trailing_partial_record_is_end_of_stream() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("j.bin");
        write_journal(&path, &[100]);
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[0xFF; 500]).unwrap();
        drop(f);

        let map = JournalMap::open(&path).unwrap();
        assert_eq!(map.byte_len(), RECORD_SIZE + 500);
        assert_eq!(map.record_count(), 1);
        assert_eq!(map.trailing_bytes(), 500);
        let mut seen = Vec::new();
        assert_eq!(map.replay(None, |r| seen.push(r.exchange_ts())), 1);
        assert_eq!(seen, vec![100]);
        assert!(map.seek_by_timestamp(101).is_none());
    }

    #[test]
    fn replay_rounds_unaligned_start_down() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("j.bin");
        write_journal(&path, &[10, 20, 30, 40]);
        let map = JournalMap::open(&path).unwrap();

        let mut seen = Vec::new();
        let n = map.replay(Some(2 * RECORD_SIZE + 17), |r| seen.push(r.sequence()));
        assert_eq!(n, 2);
        assert_eq!(seen, vec![3, 4]);

        assert_eq!(map.replay(Some(10 * RECORD_SIZE), |_| {}), 0);
        assert_eq!(map.record_at(RECORD_SIZE - 1).unwrap().index(), 0);
    }

    #[test]
    fn replay_from_timestamp_skips_earlier_records() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("j.bin");
        write_journal(&path, &[100, 200, 200, 300]);
        let map = JournalMap::open(&path).unwrap();

        let mut seen = Vec::new();
        assert_eq!(map.replay_from_timestamp(150, |r| seen.push(r.sequence())), 3);
        assert_eq!(seen, vec![2, 3, 4]);
        assert_eq!(map.replay_from_timestamp(301, |_| panic!("no records expected")), 0);
    }

    #[test]
    fn empty_journal_loads_as_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("empty.bin");
        File::create(&path).unwrap();
        let map = JournalMap::open(&path).unwrap();
        assert_eq!(map.record_count(), 0);
        assert!(map.seek_by_timestamp(0).is_none());
        assert_eq!(map.iter_from(0).len(), 0);
    }

    #[test]
    fn engine_swaps_mappings_and_keeps_old_readers_valid() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.bin");
        let b = tmp.path().join("b.bin");
        write_journal(&a, &[1, 2, 3]);
        write_journal(&b, &[7]);

        let engine = ReplayEngine::new();
        assert!(engine.current().is_none());
        assert!(engine.load(tmp.path().join("missing.bin")).is_err());

        let first = engine.load(&a).unwrap();
        let second = engine.load(&b).unwrap();
        assert_eq!(engine.current().unwrap().path(), b.as_path());
        assert_eq!(first.record_count(), 3);
        assert_eq!(second.record_count(), 1);

        assert!(engine.close().unwrap());
        assert!(!engine.close().unwrap());
        assert!(engine.current().is_none());
        assert_eq!(second.record(0).unwrap().exchange_ts(), 7);
    }

    #[test]
    fn shared_map_is_readable_from_many_threads() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("j.bin");
        let stamps: Vec<u64> = (0..64).map(|i| i * 10).collect();
        write_journal(&path, &stamps);
        let engine = ReplayEngine::new();
        let map = engine.load(&path).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let map = Arc::clone(&map);
                std::thread::spawn(move || {
                    let hit = map.seek_by_timestamp(t * 100 + 5).unwrap();
                    (hit.index(), map.replay(Some(hit.offset()), |_| {}))
                })
            })
            .collect();
        for (t, h) in handles.into_iter().enumerate() {
            let (idx, n) = h.join().unwrap();
            assert_eq!(idx, t * 10 + 1);
            assert_eq!(n, 64 - idx);
        }
    }
}
