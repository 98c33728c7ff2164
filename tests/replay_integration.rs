use crc32fast::Hasher as Crc32;
use depth_journal::{
    BookLevel, BookSnapshot, FixedClock, JournalDirectory, Recorder, ReplayEngine, RingConfig,
    RingPublisher, RingReader, RotationPolicy, RECORD_SIZE,
};
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use time::macros::datetime;

fn book(key: &str, ts: u64, mid: f64) -> BookSnapshot {
    let bids = (0..35).map(|i| BookLevel::new(mid - 0.25 * (i + 1) as f64, 10 + i)).collect();
    let asks = (0..3).map(|i| BookLevel::new(mid + 0.25 * (i + 1) as f64, 5 + i)).collect();
    BookSnapshot::new(key, ts, ts + 1_000).with_levels(bids, asks)
}

fn record_session(base: &Path, ring: Option<RingPublisher>) -> Recorder {
    let clock = Arc::new(FixedClock::new(datetime!(2025-03-14 09:15 UTC)));
    let directory = JournalDirectory::new(base).with_clock(clock);
    let mut recorder = Recorder::new(directory, ring);
    for i in 0..50u64 {
        let key = if i % 2 == 0 { "NSE_FO|101" } else { "NSE_FO|202" };
        recorder.record(&book(key, 1_000_000 + i * 100, 250.0 + i as f64 * 0.5));
    }
    recorder
}

fn digest(path: &Path) -> u32 {
    let engine = ReplayEngine::new();
    let map = engine.load(path).unwrap();
    let mut crc = Crc32::new();
    map.replay(None, |r| crc.update(r.as_bytes()));
    crc.finalize()
}

#[test]
fn recorded_session_replays_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let stats = record_session(dir.path(), None).shutdown();
    assert_eq!(stats.journaled, 50);

    let path = dir.path().join("NSE_FO/101/2025-03-14_09.bin");
    let engine = ReplayEngine::new();
    let map = engine.load(&path).unwrap();
    assert_eq!(map.record_count(), 25);
    assert_eq!(map.trailing_bytes(), 0);

    let mut seqs = Vec::new();
    let mut prev_ts = 0;
    let n = map.replay(None, |r| {
        assert_eq!(r.instrument_id(), 101);
        assert_eq!(r.depth(), 30);
        assert!(r.exchange_ts() >= prev_ts);
        prev_ts = r.exchange_ts();
        seqs.push(r.sequence());
    });
    assert_eq!(n, 25);
    assert_eq!(seqs, (1..=25).collect::<Vec<u64>>());

    let first = map.record(0).unwrap();
    assert_eq!(first.bid(0).unwrap().price, 24975);
    assert_eq!(first.bid(29).unwrap().price, 24250);
    assert_eq!(first.ask(2).unwrap().qty, 7);
    assert!(first.ask(3).unwrap().is_empty());

    // Records for token 101 are at 1_000_000 + 200k.
    let hit = map.seek_by_timestamp(1_000_150).unwrap();
    assert_eq!(hit.exchange_ts(), 1_000_200);
    assert_eq!(hit.index(), 1);
    assert_eq!(map.replay_from_timestamp(1_000_150, |_| {}), 24);
}

#[test]
fn identical_sessions_have_identical_digests() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    record_session(a.path(), None).shutdown();
    record_session(b.path(), None).shutdown();
    for rel in ["NSE_FO/101/2025-03-14_09.bin", "NSE_FO/202/2025-03-14_09.bin"] {
        assert_eq!(digest(&a.path().join(rel)), digest(&b.path().join(rel)), "{rel}");
    }
    assert_ne!(
        digest(&a.path().join("NSE_FO/101/2025-03-14_09.bin")),
        digest(&a.path().join("NSE_FO/202/2025-03-14_09.bin"))
    );
}

#[test]
fn ring_consumer_sees_latest_records() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = RingConfig::with_slots(dir.path().join("shm/ring.bin"), 16);
    let ring = RingPublisher::create(&cfg).unwrap();
    let recorder = record_session(&dir.path().join("journal"), Some(ring));

    let reader = RingReader::open(&cfg.path, RECORD_SIZE as u64).unwrap();
    assert_eq!(reader.write_sequence(), 50);
    assert!(reader.read(30).is_none());
    let latest = reader.read(50).unwrap();
    let view = depth_journal::RecordView::new(&latest).unwrap();
    assert_eq!(view.instrument_id(), 202);
    assert_eq!(view.exchange_ts(), 1_000_000 + 49 * 100);
    // Journal sequence of the 25th record for token 202.
    assert_eq!(view.sequence(), 25);
    recorder.shutdown();
}

#[test]
fn hourly_rotation_splits_files() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(FixedClock::new(datetime!(2025-03-14 09:59 UTC)));
    let directory = JournalDirectory::new(dir.path())
        .with_rotation(RotationPolicy::Hourly)
        .with_clock(clock.clone());
    let mut recorder = Recorder::new(directory, None);
    for ts in 0..3 {
        recorder.record(&book("BSE_EQ|9", ts, 10.0));
    }
    clock.advance(time::Duration::minutes(2));
    for ts in 3..5 {
        assert_eq!(recorder.record(&book("BSE_EQ|9", ts, 10.0)), Some(ts - 2));
    }
    recorder.shutdown();

    let engine = ReplayEngine::new();
    let before = engine.load(dir.path().join("BSE_EQ/9/2025-03-14_09.bin")).unwrap();
    let after = engine.load(dir.path().join("BSE_EQ/9/2025-03-14_10.bin")).unwrap();
    assert_eq!(before.record_count(), 3);
    assert_eq!(after.record_count(), 2);
    assert_eq!(after.record(0).unwrap().exchange_ts(), 3);
}

#[test]
fn player_reports_digest_and_seek() {
    let dir = tempfile::tempdir().unwrap();
    record_session(dir.path(), None).shutdown();
    let path = dir.path().join("NSE_FO/202/2025-03-14_09.bin");

    let out = Command::new(env!("CARGO_BIN_EXE_player"))
        .arg("--input")
        .arg(&path)
        .arg("--digest")
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert_eq!(stdout.trim(), format!("crc32={:#010x}", digest(&path)));
    assert!(String::from_utf8_lossy(&out.stderr).contains("Replayed 25 of 25 records"));

    let out = Command::new(env!("CARGO_BIN_EXE_player"))
        .arg("-i")
        .arg(&path)
        .args(["--from-ts", "1004000", "--json"])
        .output()
        .unwrap();
    assert!(out.status.success());
    let lines: Vec<serde_json::Value> = String::from_utf8_lossy(&out.stdout)
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    // Token 202 records sit at 1_000_100 + 200k; the first >= 1_004_000 is 1_004_100.
    assert_eq!(lines.len(), 5);
    assert_eq!(lines[0]["exchange_ts"], 1_004_100);
    assert_eq!(lines[0]["sequence"], 21);
    assert_eq!(lines[0]["bids"].as_array().unwrap().len(), 30);
}

#[test]
fn player_dump_formats_millisecond_timestamps() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(FixedClock::new(datetime!(2025-03-14 09:15 UTC)));
    let directory = JournalDirectory::new(dir.path()).with_clock(clock);
    let mut recorder = Recorder::new(directory, None);
    // 2025-03-14T09:15:00Z in epoch milliseconds; receive_ts lands 1s later.
    recorder.record(&book("NSE_EQ|7", 1_741_943_700_000, 100.0));
    recorder.shutdown();
    let path = dir.path().join("NSE_EQ/7/2025-03-14_09.bin");

    let dump = |extra: &[&str]| {
        let out = Command::new(env!("CARGO_BIN_EXE_player"))
            .arg("-i")
            .arg(&path)
            .args(["--dump", "--top", "1"])
            .args(extra)
            .output()
            .unwrap();
        assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
        String::from_utf8_lossy(&out.stdout).into_owned()
    };

    let default = dump(&[]);
    assert!(default.contains("ex=2025-03-14T09:15:00Z"), "{default}");
    assert!(default.contains("rx=2025-03-14T09:15:01Z"), "{default}");

    let raw = dump(&["--ts-unit", "raw"]);
    assert!(raw.contains("ex=1741943700000 rx=1741943701000"), "{raw}");
}
