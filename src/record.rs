//! Canonical record layout and codec.
//!
//! Every record in a journal file and in the shared ring is exactly
//! [`RECORD_SIZE`] bytes: a 64-byte event header followed by a 968-byte L2
//! snapshot payload. All integers are little-endian. There is no file-level
//! header, so the layout below is the whole on-disk contract.
//!
//! ```text
//! header  0  sequence       u64
//!         8  exchange_ts    u64
//!        16  receive_ts     u64
//!        24  instrument_id  u32
//!        28  event_type     u16
//!        30  payload_size   u16
//!        32  source         u32   (zero)
//!        36  flags          u32   (zero)
//!        40  reserved1      u64   (zero)
//!        48  reserved2      u64   (zero)
//!        56  padding to 64
//! payload 0  depth          u8
//!         1  padding to 8
//!         8  bids  30 x {price i64, qty i64}
//!       488  asks  30 x {price i64, qty i64}
//! ```
//!
//! Prices are stored as `venue price * 100`, truncated toward zero. Changing
//! the scale is a format break and must be signalled through `event_type` or
//! `flags`.
use crate::book::{BookLevel, BookSnapshot};
use serde::{Deserialize, Serialize};

pub const HEADER_SIZE: usize = 64;
pub const PAYLOAD_SIZE: usize = 968;
pub const RECORD_SIZE: usize = HEADER_SIZE + PAYLOAD_SIZE;
/// Levels per side in an L2 snapshot payload.
pub const L2_DEPTH: usize = 30;
pub const LEVEL_SIZE: usize = 16;
/// Fixed-point multiplier applied to venue prices.
pub const PRICE_SCALE: i64 = 100;

/// Byte offsets of every field, relative to the start of the record.
pub mod offsets {
    use super::{HEADER_SIZE, L2_DEPTH, LEVEL_SIZE};

    pub const SEQUENCE: usize = 0;
    pub const EXCHANGE_TS: usize = 8;
    pub const RECEIVE_TS: usize = 16;
    pub const INSTRUMENT_ID: usize = 24;
    pub const EVENT_TYPE: usize = 28;
    pub const PAYLOAD_SIZE: usize = 30;
    pub const SOURCE: usize = 32;
    pub const FLAGS: usize = 36;
    pub const RESERVED1: usize = 40;
    pub const RESERVED2: usize = 48;

    pub const DEPTH: usize = HEADER_SIZE;
    pub const BIDS: usize = HEADER_SIZE + 8;
    pub const ASKS: usize = BIDS + L2_DEPTH * LEVEL_SIZE;

    pub const LEVEL_PRICE: usize = 0;
    pub const LEVEL_QTY: usize = 8;
}

const _: () = assert!(RECORD_SIZE == 1032);
const _: () = assert!(offsets::ASKS + L2_DEPTH * LEVEL_SIZE == RECORD_SIZE);
const _: () = assert!(offsets::RESERVED2 + 8 <= HEADER_SIZE);

/// Event type codes stored at header offset 28.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    L2Snapshot = 1,
    Trade = 2,
    Status = 3,
}

impl EventType {
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1 => Some(EventType::L2Snapshot),
            2 => Some(EventType::Trade),
            3 => Some(EventType::Status),
            _ => None,
        }
    }
}

/// Decoded event header. Reserved words are always written as zero and are
/// not carried here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EventHeader {
    pub sequence: u64,
    pub exchange_ts: u64,
    pub receive_ts: u64,
    pub instrument_id: u32,
    pub event_type: u16,
    pub payload_size: u16,
    pub source: u32,
    pub flags: u32,
}

impl EventHeader {
    /// Header for an L2 snapshot record.
    pub fn l2_snapshot(sequence: u64, exchange_ts: u64, receive_ts: u64, instrument_id: u32) -> Self {
        Self {
            sequence,
            exchange_ts,
            receive_ts,
            instrument_id,
            event_type: EventType::L2Snapshot as u16,
            payload_size: PAYLOAD_SIZE as u16,
            source: 0,
            flags: 0,
        }
    }

    pub fn kind(&self) -> Option<EventType> {
        EventType::from_u16(self.event_type)
    }
}

/// One scaled depth level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Level {
    pub price: i64,
    pub qty: i64,
}

impl Level {
    pub fn is_empty(&self) -> bool {
        self.price == 0 && self.qty == 0
    }
}

/// Fixed-depth L2 payload. Unused levels are zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L2Payload {
    pub depth: u8,
    pub bids: [Level; L2_DEPTH],
    pub asks: [Level; L2_DEPTH],
}

impl Default for L2Payload {
    fn default() -> Self {
        Self {
            depth: L2_DEPTH as u8,
            bids: [Level::default(); L2_DEPTH],
            asks: [Level::default(); L2_DEPTH],
        }
    }
}

impl L2Payload {
    /// Scale the first [`L2_DEPTH`] levels of each side of `book`; anything
    /// deeper is dropped and anything shallower is zero-filled.
    pub fn from_book(book: &BookSnapshot) -> Self {
        Self::from_levels(&book.bids, &book.asks)
    }

    pub fn from_levels(bids: &[BookLevel], asks: &[BookLevel]) -> Self {
        let mut payload = Self::default();
        fill_side(&mut payload.bids, bids);
        fill_side(&mut payload.asks, asks);
        payload
    }

    /// Number of leading populated bid levels.
    pub fn bid_depth(&self) -> usize {
        self.bids.iter().take_while(|l| !l.is_empty()).count()
    }

    /// Number of leading populated ask levels.
    pub fn ask_depth(&self) -> usize {
        self.asks.iter().take_while(|l| !l.is_empty()).count()
    }
}

fn fill_side(out: &mut [Level; L2_DEPTH], levels: &[BookLevel]) {
    for (slot, level) in out.iter_mut().zip(levels.iter()) {
        *slot = Level {
            price: scale_price(level.price),
            qty: level.qty,
        };
    }
}

/// `price * 100`, truncated toward zero. NaN maps to 0 and out-of-range
/// values saturate.
#[inline]
pub fn scale_price(price: f64) -> i64 {
    (price * PRICE_SCALE as f64) as i64
}

#[inline]
pub fn unscale_price(scaled: i64) -> f64 {
    scaled as f64 / PRICE_SCALE as f64
}

#[inline]
fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn put_i64(buf: &mut [u8], off: usize, v: i64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut tmp = [0u8; 8];
    tmp.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(tmp)
}

#[inline]
fn get_i64(buf: &[u8], off: usize) -> i64 {
    let mut tmp = [0u8; 8];
    tmp.copy_from_slice(&buf[off..off + 8]);
    i64::from_le_bytes(tmp)
}

#[inline]
fn get_u32(buf: &[u8], off: usize) -> u32 {
    let mut tmp = [0u8; 4];
    tmp.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(tmp)
}

#[inline]
fn get_u16(buf: &[u8], off: usize) -> u16 {
    let mut tmp = [0u8; 2];
    tmp.copy_from_slice(&buf[off..off + 2]);
    u16::from_le_bytes(tmp)
}

/// Encode into a caller-owned buffer. Every byte of `out` is written, so a
/// reused scratch buffer never leaks a previous record.
pub fn encode_into(header: &EventHeader, payload: &L2Payload, out: &mut [u8; RECORD_SIZE]) {
    out.fill(0);
    let buf = &mut out[..];
    put_u64(buf, offsets::SEQUENCE, header.sequence);
    put_u64(buf, offsets::EXCHANGE_TS, header.exchange_ts);
    put_u64(buf, offsets::RECEIVE_TS, header.receive_ts);
    put_u32(buf, offsets::INSTRUMENT_ID, header.instrument_id);
    put_u16(buf, offsets::EVENT_TYPE, header.event_type);
    put_u16(buf, offsets::PAYLOAD_SIZE, header.payload_size);
    put_u32(buf, offsets::SOURCE, header.source);
    put_u32(buf, offsets::FLAGS, header.flags);

    buf[offsets::DEPTH] = payload.depth;
    for (i, level) in payload.bids.iter().enumerate() {
        let at = offsets::BIDS + i * LEVEL_SIZE;
        put_i64(buf, at + offsets::LEVEL_PRICE, level.price);
        put_i64(buf, at + offsets::LEVEL_QTY, level.qty);
    }
    for (i, level) in payload.asks.iter().enumerate() {
        let at = offsets::ASKS + i * LEVEL_SIZE;
        put_i64(buf, at + offsets::LEVEL_PRICE, level.price);
        put_i64(buf, at + offsets::LEVEL_QTY, level.qty);
    }
}

pub fn encode(header: &EventHeader, payload: &L2Payload) -> [u8; RECORD_SIZE] {
    let mut out = [0u8; RECORD_SIZE];
    encode_into(header, payload, &mut out);
    out
}

pub fn decode(bytes: &[u8; RECORD_SIZE]) -> (EventHeader, L2Payload) {
    let view = RecordView::from_array(bytes);
    (view.header(), view.payload())
}

/// Borrowed, zero-copy view over one encoded record, e.g. a slice of a
/// memory-mapped journal or ring slot.
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    bytes: &'a [u8; RECORD_SIZE],
}

impl<'a> RecordView<'a> {
    pub fn from_array(bytes: &'a [u8; RECORD_SIZE]) -> Self {
        Self { bytes }
    }

    /// View the first [`RECORD_SIZE`] bytes of `bytes`, or `None` if the
    /// slice is shorter than one record.
    pub fn new(bytes: &'a [u8]) -> Option<Self> {
        let bytes = bytes.get(..RECORD_SIZE)?.try_into().ok()?;
        Some(Self { bytes })
    }

    pub fn as_bytes(&self) -> &'a [u8; RECORD_SIZE] {
        self.bytes
    }

    pub fn sequence(&self) -> u64 {
        get_u64(self.bytes, offsets::SEQUENCE)
    }

    pub fn exchange_ts(&self) -> u64 {
        get_u64(self.bytes, offsets::EXCHANGE_TS)
    }

    pub fn receive_ts(&self) -> u64 {
        get_u64(self.bytes, offsets::RECEIVE_TS)
    }

    pub fn instrument_id(&self) -> u32 {
        get_u32(self.bytes, offsets::INSTRUMENT_ID)
    }

    pub fn event_type(&self) -> u16 {
        get_u16(self.bytes, offsets::EVENT_TYPE)
    }

    pub fn payload_size(&self) -> u16 {
        get_u16(self.bytes, offsets::PAYLOAD_SIZE)
    }

    pub fn source(&self) -> u32 {
        get_u32(self.bytes, offsets::SOURCE)
    }

    pub fn flags(&self) -> u32 {
        get_u32(self.bytes, offsets::FLAGS)
    }

    pub fn depth(&self) -> u8 {
        self.bytes[offsets::DEPTH]
    }

    /// Bid level `i` (0 = best), `None` past [`L2_DEPTH`].
    pub fn bid(&self, i: usize) -> Option<Level> {
        (i < L2_DEPTH).then(|| self.level_at(offsets::BIDS + i * LEVEL_SIZE))
    }

    /// Ask level `i` (0 = best), `None` past [`L2_DEPTH`].
    pub fn ask(&self, i: usize) -> Option<Level> {
        (i < L2_DEPTH).then(|| self.level_at(offsets::ASKS + i * LEVEL_SIZE))
    }

    fn level_at(&self, at: usize) -> Level {
        Level {
            price: get_i64(self.bytes, at + offsets::LEVEL_PRICE),
            qty: get_i64(self.bytes, at + offsets::LEVEL_QTY),
        }
    }

    pub fn header(&self) -> EventHeader {
        EventHeader {
            sequence: self.sequence(),
            exchange_ts: self.exchange_ts(),
            receive_ts: self.receive_ts(),
            instrument_id: self.instrument_id(),
            event_type: self.event_type(),
            payload_size: self.payload_size(),
            source: self.source(),
            flags: self.flags(),
        }
    }

    pub fn payload(&self) -> L2Payload {
        let mut payload = L2Payload {
            depth: self.depth(),
            ..L2Payload::default()
        };
        for i in 0..L2_DEPTH {
            payload.bids[i] = self.level_at(offsets::BIDS + i * LEVEL_SIZE);
            payload.asks[i] = self.level_at(offsets::ASKS + i * LEVEL_SIZE);
        }
        payload
    }
}
