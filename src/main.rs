use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{Sender, bounded};
use depth_journal::{
    BookSnapshot, Durability, JournalConfig, NativeConfig, Recorder, RingConfig, RotationPolicy,
    config, spawn_recorder,
};
use dotenvy::dotenv;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Parser)]
#[command(version, about = "Record L2 depth snapshots (JSON lines) into per-instrument journals")]
struct Args {
    /// Snapshot source: a JSON-lines file, or `-` for stdin
    #[arg(long, short = 'i', env = "INPUT", default_value = "-")]
    input: String,

    /// Journal root directory
    #[arg(long, env = "JOURNAL_DIR", default_value = config::DEFAULT_BASE_DIR)]
    journal_dir: PathBuf,

    /// File rotation: `never` or `hourly`
    #[arg(long, env = "ROTATION", default_value = "never")]
    rotation: RotationPolicy,

    /// Write durability: `buffered` or `sync`
    #[arg(long, env = "DURABILITY", default_value = "buffered")]
    durability: Durability,

    /// Shared ring segment path; the ring is disabled when omitted
    #[arg(long, env = "RING_PATH")]
    ring_path: Option<PathBuf>,

    /// Ring size in bytes (rounded down to whole records)
    #[arg(long, env = "RING_CAPACITY", default_value_t = config::DEFAULT_RING_BYTES)]
    ring_capacity: u64,

    /// Native journal engine (shared library); the pure backend is used when omitted
    #[arg(long, env = "NATIVE_LIB")]
    native_lib: Option<PathBuf>,

    /// Bytes pre-allocated per native writer
    #[arg(long, env = "NATIVE_CAPACITY", default_value_t = config::DEFAULT_NATIVE_CAPACITY)]
    native_capacity: u64,

    /// Capacity of the snapshot queue in front of the writer thread
    #[arg(long, default_value_t = 8192)]
    queue: usize,
}

impl Args {
    fn journal_config(&self) -> JournalConfig {
        JournalConfig {
            base_dir: self.journal_dir.clone(),
            rotation: self.rotation,
            durability: self.durability,
            ring: self
                .ring_path
                .as_ref()
                .map(|p| RingConfig::fitting(p, self.ring_capacity)),
            native: self.native_lib.as_ref().map(|lib| NativeConfig {
                library: lib.clone(),
                writer_capacity: self.native_capacity,
            }),
        }
    }
}

fn open_input(input: &str) -> Result<Box<dyn BufRead + Send>> {
    let reader: Box<dyn Read + Send> = if input == "-" {
        Box::new(std::io::stdin())
    } else {
        Box::new(File::open(input).with_context(|| format!("open {input}"))?)
    };
    Ok(Box::new(BufReader::with_capacity(1 << 20, reader)))
}

/// Parse snapshots line by line until EOF or the writer goes away.
fn reader_thread(input: Box<dyn BufRead + Send>, tx: Sender<BookSnapshot>) -> Result<u64> {
    let mut parsed = 0u64;
    for (lineno, line) in input.lines().enumerate() {
        let line = line.context("read snapshot line")?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<BookSnapshot>(&line) {
            Ok(snapshot) => {
                if tx.send(snapshot).is_err() {
                    break;
                }
                parsed += 1;
            }
            Err(e) => warn!(line = lineno + 1, error = %e, "skipping malformed snapshot"),
        }
    }
    Ok(parsed)
}

fn main() -> Result<()> {
    // Load environment variables from .env if present
    let _ = dotenv();
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let cfg = args.journal_config();
    let recorder = Recorder::from_config(&cfg).context("initialise recorder")?;
    info!(
        journal_dir = %cfg.base_dir.display(),
        backend = recorder.directory().backend_name(),
        ring = cfg.ring.is_some(),
        rotation = ?cfg.rotation,
        durability = ?cfg.durability,
        "recorder started"
    );

    let (tx, rx) = bounded::<BookSnapshot>(args.queue.max(1));
    let (stop_tx, stop_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("install Ctrl-C handler")?;

    let writer = spawn_recorder(recorder, rx, stop_rx).context("spawn writer thread")?;

    let input = open_input(&args.input)?;
    // Detached: on Ctrl-C the writer stops without waiting for stdin to close.
    std::thread::spawn(move || match reader_thread(input, tx) {
        Ok(parsed) => info!(parsed, "input exhausted"),
        Err(e) => error!("reader thread error: {e:#}"),
    });

    let stats = writer
        .join()
        .map_err(|_| anyhow::anyhow!("writer thread panicked"))?;
    eprintln!(
        "Recorded {} snapshots ({} journaled, {} dropped, {} published to ring).",
        stats.received, stats.journaled, stats.dropped, stats.published
    );
    Ok(())
}
