use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use crc32fast::Hasher as Crc32;
use depth_journal::record::{EventHeader, Level, unscale_price};
use depth_journal::replay::{RecordRef, ReplayEngine};
use serde::Serialize;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[derive(Debug, Parser)]
#[command(about = "Replay a depth journal: seek by timestamp, dump books, fingerprint runs")]
struct Args {
    /// Journal file to replay (.bin)
    #[arg(long, short = 'i')]
    input: PathBuf,

    /// Start at the first record whose exchange timestamp is >= this value
    #[arg(long, conflicts_with = "offset")]
    from_ts: Option<u64>,

    /// Start at this byte offset (rounded down to a record boundary)
    #[arg(long)]
    offset: Option<usize>,

    /// Print top-of-book for every record
    #[arg(long, default_value_t = false)]
    dump: bool,

    /// Number of levels to print when dumping
    #[arg(long, default_value_t = 5)]
    top: usize,

    /// Fold every replayed record into a CRC32 fingerprint
    #[arg(long, default_value_t = false)]
    digest: bool,

    /// Print each record as one JSON object per line
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Unit of the recorded timestamps, used when dumping
    #[arg(long, value_enum, default_value_t = TsUnit::Ms)]
    ts_unit: TsUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TsUnit {
    S,
    Ms,
    Us,
    Ns,
    /// Print timestamps as stored
    Raw,
}

impl TsUnit {
    fn nanos_per_tick(self) -> Option<i128> {
        match self {
            TsUnit::S => Some(1_000_000_000),
            TsUnit::Ms => Some(1_000_000),
            TsUnit::Us => Some(1_000),
            TsUnit::Ns => Some(1),
            TsUnit::Raw => None,
        }
    }
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    offset: usize,
    #[serde(flatten)]
    header: &'a EventHeader,
    bids: Vec<JsonLevel>,
    asks: Vec<JsonLevel>,
}

#[derive(Serialize)]
struct JsonLevel {
    price: f64,
    qty: i64,
}

fn levels(side: impl Fn(usize) -> Option<Level>, top: usize) -> Vec<Level> {
    (0..top).map_while(side).filter(|l| !l.is_empty()).collect()
}

fn format_ts(ts: u64, unit: TsUnit) -> String {
    unit.nanos_per_tick()
        .and_then(|scale| OffsetDateTime::from_unix_timestamp_nanos(ts as i128 * scale).ok())
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| ts.to_string())
}

fn dump_record<W: Write>(out: &mut W, r: &RecordRef<'_>, top: usize, unit: TsUnit) -> std::io::Result<()> {
    let bids = levels(|i| r.bid(i), top);
    let asks = levels(|i| r.ask(i), top);
    writeln!(
        out,
        "seq={} id={} ex={} rx={} | top{} bids / asks:",
        r.sequence(),
        r.instrument_id(),
        format_ts(r.exchange_ts(), unit),
        format_ts(r.receive_ts(), unit),
        top
    )?;
    for i in 0..bids.len().max(asks.len()) {
        let b = bids
            .get(i)
            .map(|l| format!("{:>3}: {:>10.2} x {:>7}", i, unscale_price(l.price), l.qty))
            .unwrap_or_else(|| format!("{:>3}: -", i));
        let a = asks
            .get(i)
            .map(|l| format!("{:>10.2} x {:>7}", unscale_price(l.price), l.qty))
            .unwrap_or_else(|| "-".to_string());
        writeln!(out, "{} | {}", b, a)?;
    }
    writeln!(out, "---")
}

fn json_record<W: Write>(out: &mut W, r: &RecordRef<'_>) -> Result<()> {
    let to_json = |l: Level| JsonLevel {
        price: unscale_price(l.price),
        qty: l.qty,
    };
    let header = r.header();
    let rec = JsonRecord {
        offset: r.offset(),
        header: &header,
        bids: levels(|i| r.bid(i), usize::MAX).into_iter().map(to_json).collect(),
        asks: levels(|i| r.ask(i), usize::MAX).into_iter().map(to_json).collect(),
    };
    serde_json::to_writer(&mut *out, &rec)?;
    writeln!(out)?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let engine = ReplayEngine::new();
    let journal = engine
        .load(&args.input)
        .with_context(|| format!("load {:?}", args.input))?;

    let start = match (args.from_ts, args.offset) {
        (Some(ts), _) => match journal.seek_by_timestamp(ts) {
            Some(hit) => Some(hit.offset()),
            None => {
                eprintln!("No record at or after ts={ts} in {:?}.", args.input);
                Some(journal.byte_len())
            }
        },
        (None, offset) => offset,
    };

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut crc = Crc32::new();
    let mut failure: Option<anyhow::Error> = None;
    let replayed = journal.replay(start, |r| {
        if failure.is_some() {
            return;
        }
        if args.digest {
            crc.update(r.as_bytes());
        }
        let outcome = if args.json {
            json_record(&mut out, &r)
        } else if args.dump {
            dump_record(&mut out, &r, args.top, args.ts_unit).map_err(Into::into)
        } else {
            Ok(())
        };
        if let Err(e) = outcome {
            failure = Some(e);
        }
    });
    out.flush()?;
    if let Some(e) = failure {
        return Err(e.context("write replay output"));
    }

    eprintln!(
        "Replayed {} of {} records from {:?} ({} trailing bytes ignored).",
        replayed,
        journal.record_count(),
        args.input,
        journal.trailing_bytes()
    );
    if args.digest {
        println!("crc32={:#010x}", crc.finalize());
    }
    engine.close()?;
    Ok(())
}
