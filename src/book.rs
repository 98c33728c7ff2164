//! Upstream order book snapshot model.
//!
//! This is the shape ingestion code hands to the journal: an instrument key
//! of the form `SEGMENT|TOKEN`, two timestamps, and the bid and ask ladders
//! ordered best-first. Prices are venue prices as `f64`; the record codec
//! applies the fixed-point scale when a snapshot is encoded.
use serde::{Deserialize, Serialize};

/// Placeholder used for a missing segment or token in an instrument key.
pub const UNKNOWN_PART: &str = "UNKNOWN";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    /// Venue price.
    pub price: f64,
    /// Quantity resting at that price.
    pub qty: i64,
}

impl BookLevel {
    pub fn new(price: f64, qty: i64) -> Self {
        Self { price, qty }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    /// `SEGMENT|TOKEN`, e.g. `NSE_FO|12345`.
    pub instrument_key: String,
    /// Timestamp assigned by the venue.
    pub exchange_ts: u64,
    /// Local ingestion timestamp.
    pub receive_ts: u64,
    /// Buy side, best price at index 0.
    #[serde(default)]
    pub bids: Vec<BookLevel>,
    /// Sell side, best price at index 0.
    #[serde(default)]
    pub asks: Vec<BookLevel>,
}

impl BookSnapshot {
    pub fn new(instrument_key: impl Into<String>, exchange_ts: u64, receive_ts: u64) -> Self {
        Self {
            instrument_key: instrument_key.into(),
            exchange_ts,
            receive_ts,
            bids: Vec::new(),
            asks: Vec::new(),
        }
    }

    /// Builder-style helper used by ingestion adapters and tests.
    pub fn with_levels(mut self, bids: Vec<BookLevel>, asks: Vec<BookLevel>) -> Self {
        self.bids = bids;
        self.asks = asks;
        self
    }

    pub fn best_bid(&self) -> Option<&BookLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&BookLevel> {
        self.asks.first()
    }
}

/// A parsed `SEGMENT|TOKEN` instrument key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstrumentKey<'a> {
    pub segment: &'a str,
    pub token: &'a str,
}

impl<'a> InstrumentKey<'a> {
    /// Split on the first `|`. Missing or empty parts become [`UNKNOWN_PART`].
    pub fn parse(key: &'a str) -> Self {
        let (segment, token) = match key.split_once('|') {
            Some((s, t)) => (s, t),
            None => (key, ""),
        };
        let or_unknown = |s: &'a str| if s.is_empty() { UNKNOWN_PART } else { s };
        Self {
            segment: or_unknown(segment),
            token: or_unknown(token),
        }
    }

    /// Numeric instrument id carried in the record header: the token when it
    /// parses as `u32`, otherwise 0.
    pub fn instrument_id(&self) -> u32 {
        self.token.parse().unwrap_or(0)
    }
}
