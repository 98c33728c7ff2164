//! Memory-mapped single-producer ring for local fan-out.
//!
//! Segment layout:
//!
//! ```text
//! offset 0   write_sequence  u64   last published sequence (0 = none yet)
//! offset 8   capacity        u64   bytes of ring data
//! offset 16  ring data       capacity bytes, `capacity / record_len` slots
//! ```
//!
//! Sequence `s` (1-based) lives in slot `s mod slots`, i.e. at data offset
//! `(s * record_len) mod capacity`. The publisher copies the record first and
//! then stores `write_sequence` with release ordering, so a reader that
//! acquires sequence `s` sees the bytes of record `s` in full. The ring is
//! lossy: nothing stops the publisher from lapping a slow reader.
//!
//! Header integers are native-endian atomics, which is little-endian on every
//! supported target.
use crate::config::RingConfig;
use crate::error::{JournalError, Result};
use memmap2::{Mmap, MmapMut};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering, fence};
use tracing::{debug, info};

pub const RING_HEADER_SIZE: usize = 16;
const WRITE_SEQUENCE_OFFSET: usize = 0;
const CAPACITY_OFFSET: usize = 8;

fn check_geometry(capacity: u64, record_len: u64) -> Result<()> {
    if capacity == 0 || record_len == 0 || capacity % record_len != 0 {
        return Err(JournalError::RingGeometry { capacity, record_len });
    }
    Ok(())
}

/// # Safety
/// `base` must point at a live mapping of at least `RING_HEADER_SIZE` bytes
/// whose start is 8-byte aligned (mappings are page aligned).
unsafe fn write_sequence_cell<'a>(base: *const u8) -> &'a AtomicU64 {
    unsafe { &*(base.add(WRITE_SEQUENCE_OFFSET) as *const AtomicU64) }
}

/// The single writer of a ring segment.
pub struct RingPublisher {
    mmap: MmapMut,
    path: PathBuf,
    capacity: u64,
    record_len: u64,
    slots: u64,
    sequence: u64,
}

impl RingPublisher {
    /// Create (or reset) the segment at `config.path`.
    ///
    /// Fails with [`JournalError::RingGeometry`] unless the capacity is a
    /// non-zero multiple of a non-zero record length, so a record can never
    /// straddle the end of the ring.
    pub fn create(config: &RingConfig) -> Result<Self> {
        check_geometry(config.capacity, config.record_len)?;
        let path = config.path.clone();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| JournalError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| JournalError::io(&path, e))?;
        let total = config
            .capacity
            .checked_add(RING_HEADER_SIZE as u64)
            .ok_or(JournalError::RingGeometry {
                capacity: config.capacity,
                record_len: config.record_len,
            })?;
        file.set_len(total).map_err(|e| JournalError::io(&path, e))?;

        // SAFETY: the file was just sized by us and this process is its only
        // writer; readers map it read-only.
        let mut mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| JournalError::io(&path, e))?;
        mmap[CAPACITY_OFFSET..RING_HEADER_SIZE].copy_from_slice(&config.capacity.to_ne_bytes());
        // SAFETY: the mapping is page aligned and longer than the header.
        unsafe { write_sequence_cell(mmap.as_ptr()) }.store(0, Ordering::Release);

        let slots = config.capacity / config.record_len;
        info!(
            path = %path.display(),
            capacity = config.capacity,
            record_len = config.record_len,
            slots,
            "ring segment created"
        );
        Ok(Self {
            mmap,
            path,
            capacity: config.capacity,
            record_len: config.record_len,
            slots,
            sequence: 0,
        })
    }

    /// Copy `record` into the next slot and publish its sequence.
    ///
    /// `record` must be exactly `record_len` bytes long.
    pub fn publish(&mut self, record: &[u8]) -> Result<u64> {
        if record.len() as u64 != self.record_len {
            return Err(JournalError::RecordLength {
                expected: self.record_len as usize,
                actual: record.len(),
            });
        }
        let seq = self.sequence + 1;
        let start = RING_HEADER_SIZE + self.slot_offset(seq);
        self.mmap[start..start + record.len()].copy_from_slice(record);
        // SAFETY: see `create`; the store orders the copy above before it.
        unsafe { write_sequence_cell(self.mmap.as_ptr()) }.store(seq, Ordering::Release);
        self.sequence = seq;
        Ok(seq)
    }

    /// Last published sequence.
    pub fn write_sequence(&self) -> u64 {
        self.sequence
    }

    /// Byte offset of `seq`'s slot within the ring data.
    pub fn slot_offset(&self, seq: u64) -> usize {
        ((seq % self.slots) * self.record_len) as usize
    }

    /// Current contents of the slot `seq` maps to. Only meaningful while
    /// `seq` has not been lapped.
    pub fn slot(&self, seq: u64) -> &[u8] {
        let start = RING_HEADER_SIZE + self.slot_offset(seq);
        &self.mmap[start..start + self.record_len as usize]
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn record_len(&self) -> u64 {
        self.record_len
    }

    pub fn slots(&self) -> u64 {
        self.slots
    }

    /// Ask the OS to write the mapping back to the file.
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush().map_err(|e| JournalError::io(&self.path, e))
    }
}

impl std::fmt::Debug for RingPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingPublisher")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .field("record_len", &self.record_len)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Read-only consumer of a ring segment, usually in another process.
///
/// Requires at least 2 slots; a single-slot segment can be published to but
/// not read back.
pub struct RingReader {
    mmap: Mmap,
    capacity: u64,
    record_len: u64,
    slots: u64,
}

impl RingReader {
    /// Map an existing segment whose records are `record_len` bytes.
    pub fn open(path: impl AsRef<Path>, record_len: u64) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| JournalError::io(path, e))?;
        // SAFETY: read-only mapping; the publisher never resizes the segment
        // after creating it.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| JournalError::io(path, e))?;
        if mmap.len() < RING_HEADER_SIZE {
            return Err(JournalError::RingHeader {
                path: path.to_path_buf(),
                message: format!("{} bytes is shorter than the ring header", mmap.len()),
            });
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&mmap[CAPACITY_OFFSET..RING_HEADER_SIZE]);
        let capacity = u64::from_ne_bytes(raw);
        let fits = capacity
            .checked_add(RING_HEADER_SIZE as u64)
            .is_some_and(|total| total <= mmap.len() as u64);
        if !fits {
            return Err(JournalError::RingHeader {
                path: path.to_path_buf(),
                message: format!("header capacity {capacity} exceeds segment size {}", mmap.len()),
            });
        }
        check_geometry(capacity, record_len)?;
        // The slot after `write_sequence` may be mid-write, so a single-slot
        // ring never has a stable record to hand out.
        if capacity / record_len < 2 {
            return Err(JournalError::RingHeader {
                path: path.to_path_buf(),
                message: "a readable ring needs at least 2 slots".to_string(),
            });
        }
        debug!(path = %path.display(), capacity, record_len, "ring segment attached");
        Ok(Self {
            mmap,
            capacity,
            record_len,
            slots: capacity / record_len,
        })
    }

    /// Latest published sequence (acquire).
    pub fn write_sequence(&self) -> u64 {
        // SAFETY: the mapping is page aligned and at least a header long.
        unsafe { write_sequence_cell(self.mmap.as_ptr()) }.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn slots(&self) -> u64 {
        self.slots
    }

    /// Whether `seq` is published and its slot cannot be under rewrite given
    /// the writer is at `ws`. The slot of `ws + 1` may already be changing.
    fn readable(&self, seq: u64, ws: u64) -> bool {
        seq != 0 && seq <= ws && ws - seq + 1 < self.slots
    }

    /// Copy record `seq` into `out`. Returns `Ok(false)` when `seq` is not
    /// published yet or the writer has lapped it (before or during the copy).
    pub fn read_into(&self, seq: u64, out: &mut [u8]) -> Result<bool> {
        if out.len() as u64 != self.record_len {
            return Err(JournalError::RecordLength {
                expected: self.record_len as usize,
                actual: out.len(),
            });
        }
        if !self.readable(seq, self.write_sequence()) {
            return Ok(false);
        }
        let start = RING_HEADER_SIZE + ((seq % self.slots) * self.record_len) as usize;
        // SAFETY: `start + record_len <= 16 + capacity <= mmap.len()` was
        // checked in `open`. The bytes may be concurrently rewritten by the
        // publisher; the lap check below discards such a copy.
        unsafe {
            ptr::copy_nonoverlapping(self.mmap.as_ptr().add(start), out.as_mut_ptr(), out.len());
        }
        fence(Ordering::Acquire);
        Ok(self.readable(seq, self.write_sequence()))
    }

    /// Owned copy of record `seq`, or `None` if unavailable.
    pub fn read(&self, seq: u64) -> Option<Vec<u8>> {
        let mut out = vec![0u8; self.record_len as usize];
        match self.read_into(seq, &mut out) {
            Ok(true) => Some(out),
            _ => None,
        }
    }
}

impl std::fmt::Debug for RingReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingReader")
            .field("capacity", &self.capacity)
            .field("record_len", &self.record_len)
            .field("write_sequence", &self.write_sequence())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{EventHeader, L2Payload, RECORD_SIZE, RecordView, encode};

    fn record(seq: u64) -> [u8; RECORD_SIZE] {
        encode(&EventHeader::l2_snapshot(seq, seq * 10, seq * 10 + 1, 7), &L2Payload::default())
    }

    #[test]
    fn rejects_bad_geometry() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ring.bin");
        for (capacity, record_len) in [(1000, 1032), (4 * 1032 + 1, 1032), (0, 1032), (1032, 0)] {
            let cfg = RingConfig { path: path.clone(), capacity, record_len };
            let err = RingPublisher::create(&cfg).unwrap_err();
            assert!(matches!(err, JournalError::RingGeometry { .. }), "{capacity}/{record_len}");
        }
    }

    #[test]
    fn fifth_publish_overwrites_first_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = RingConfig::with_slots(tmp.path().join("ring.bin"), 4);
        let mut ring = RingPublisher::create(&cfg).unwrap();
        assert_eq!(std::fs::metadata(&cfg.path).unwrap().len(), 16 + 4 * RECORD_SIZE as u64);

        for seq in 1..=5 {
            assert_eq!(ring.publish(&record(seq)).unwrap(), seq);
        }
        assert_eq!(ring.write_sequence(), 5);
        assert_eq!(ring.slot_offset(1), RECORD_SIZE);
        assert_eq!(ring.slot_offset(5), ring.slot_offset(1));

        let view = RecordView::new(ring.slot(1)).unwrap();
        assert_eq!(view.sequence(), 5);
        assert_eq!(view.exchange_ts(), 50);

        let bytes = std::fs::read(&cfg.path).unwrap();
        assert_eq!(&bytes[0..8], &5u64.to_ne_bytes());
        assert_eq!(&bytes[8..16], &(4 * RECORD_SIZE as u64).to_ne_bytes());
        let first_slot = &bytes[16 + RECORD_SIZE..16 + 2 * RECORD_SIZE];
        assert_eq!(RecordView::new(first_slot).unwrap().sequence(), 5);
    }

    #[test]
    fn publish_rejects_wrong_length() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ring = RingPublisher::create(&RingConfig::with_slots(tmp.path().join("r.bin"), 2)).unwrap();
        let err = ring.publish(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, JournalError::RecordLength { expected: RECORD_SIZE, actual: 10 }));
        assert_eq!(ring.write_sequence(), 0);
    }

    #[test]
    fn reader_sees_published_records_until_lapped() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = RingConfig::with_slots(tmp.path().join("ring.bin"), 4);
        let mut ring = RingPublisher::create(&cfg).unwrap();
        let reader = RingReader::open(&cfg.path, RECORD_SIZE as u64).unwrap();
        assert_eq!(reader.write_sequence(), 0);
        assert!(reader.read(1).is_none());

        ring.publish(&record(1)).unwrap();
        ring.publish(&record(2)).unwrap();
        assert_eq!(reader.write_sequence(), 2);
        let got = reader.read(1).unwrap();
        assert_eq!(RecordView::new(&got).unwrap().sequence(), 1);
        assert!(reader.read(3).is_none());

        for seq in 3..=6 {
            ring.publish(&record(seq)).unwrap();
        }
        assert!(reader.read(1).is_none());
        assert!(reader.read(2).is_none());
        assert!(reader.read(3).is_none());
        for seq in 4..=6 {
            let got = reader.read(seq).unwrap();
            assert_eq!(RecordView::new(&got).unwrap().sequence(), seq);
        }
    }

    #[test]
    fn reader_validates_header() {
        let tmp = tempfile::tempdir().unwrap();
        let short = tmp.path().join("short.bin");
        std::fs::write(&short, [0u8; 8]).unwrap();
        assert!(matches!(
            RingReader::open(&short, RECORD_SIZE as u64).unwrap_err(),
            JournalError::RingHeader { .. }
        ));

        let lying = tmp.path().join("lying.bin");
        let mut bytes = vec![0u8; 16 + RECORD_SIZE];
        bytes[8..16].copy_from_slice(&(8 * RECORD_SIZE as u64).to_ne_bytes());
        std::fs::write(&lying, bytes).unwrap();
        assert!(matches!(
            RingReader::open(&lying, RECORD_SIZE as u64).unwrap_err(),
            JournalError::RingHeader { .. }
        ));

        let huge = tmp.path().join("huge.bin");
        let mut bytes = vec![0u8; 16 + RECORD_SIZE];
        bytes[8..16].copy_from_slice(&u64::MAX.to_ne_bytes());
        std::fs::write(&huge, bytes).unwrap();
        assert!(matches!(
            RingReader::open(&huge, RECORD_SIZE as u64).unwrap_err(),
            JournalError::RingHeader { .. }
        ));

        let cfg = RingConfig::with_slots(tmp.path().join("ok.bin"), 2);
        RingPublisher::create(&cfg).unwrap();
        assert!(matches!(
            RingReader::open(&cfg.path, 1000).unwrap_err(),
            JournalError::RingGeometry { .. }
        ));
    }

    #[test]
    fn single_slot_ring_publishes_but_cannot_be_read() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = RingConfig::with_slots(tmp.path().join("one.bin"), 1);
        let mut ring = RingPublisher::create(&cfg).unwrap();
        assert_eq!(ring.publish(&record(1)).unwrap(), 1);
        assert_eq!(ring.slot_offset(1), 0);
        assert!(matches!(
            RingReader::open(&cfg.path, RECORD_SIZE as u64).unwrap_err(),
            JournalError::RingHeader { .. }
        ));
    }
}
