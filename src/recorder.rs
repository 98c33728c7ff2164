//! Snapshot ingestion: journal every snapshot and mirror it onto the ring.
//!
//! [`Recorder`] is the synchronous core. [`spawn_recorder`] runs one on a
//! dedicated writer thread fed by a bounded channel, the same shape the
//! capture tool uses for its file writer.
use crate::book::{BookSnapshot, InstrumentKey};
use crate::config::JournalConfig;
use crate::directory::JournalDirectory;
use crate::error::Result;
use crate::journal::RecordMeta;
use crate::record::{L2Payload, RECORD_SIZE, encode_into};
use crate::ring::RingPublisher;
use crossbeam_channel::{Receiver, select};
use std::thread::JoinHandle;
use tracing::{info, warn};

/// Counters kept by a [`Recorder`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecorderStats {
    /// Snapshots handed to [`Recorder::record`].
    pub received: u64,
    /// Snapshots appended to a journal.
    pub journaled: u64,
    /// Snapshots whose journal write was dropped.
    pub dropped: u64,
    /// Records published to the ring.
    pub published: u64,
}

pub struct Recorder {
    directory: JournalDirectory,
    ring: Option<RingPublisher>,
    scratch: Box<[u8; RECORD_SIZE]>,
    stats: RecorderStats,
}

impl Recorder {
    pub fn new(directory: JournalDirectory, ring: Option<RingPublisher>) -> Self {
        Self {
            directory,
            ring,
            scratch: Box::new([0u8; RECORD_SIZE]),
            stats: RecorderStats::default(),
        }
    }

    /// Build the backend, directory and (if configured) ring described by
    /// `config`.
    pub fn from_config(config: &JournalConfig) -> Result<Self> {
        let directory = JournalDirectory::from_config(config)?;
        let ring = config.ring.as_ref().map(RingPublisher::create).transpose()?;
        Ok(Self::new(directory, ring))
    }

    /// Journal `snapshot` and publish the same encoded record to the ring.
    ///
    /// Journal failures are isolated per instrument and never stop the ring:
    /// a snapshot whose journal write was dropped is still published, with
    /// sequence 0 in its header. Returns the journal sequence, if any.
    pub fn record(&mut self, snapshot: &BookSnapshot) -> Option<u64> {
        self.stats.received += 1;
        let key = InstrumentKey::parse(&snapshot.instrument_key);
        let meta = RecordMeta::l2(snapshot.exchange_ts, snapshot.receive_ts, key.instrument_id());
        let payload = L2Payload::from_book(snapshot);

        let seq = self.directory.append(&snapshot.instrument_key, &meta, &payload);
        match seq {
            Some(_) => self.stats.journaled += 1,
            None => self.stats.dropped += 1,
        }

        if let Some(ring) = self.ring.as_mut() {
            encode_into(&meta.header(seq.unwrap_or(0)), &payload, &mut self.scratch);
            match ring.publish(&self.scratch[..]) {
                Ok(_) => self.stats.published += 1,
                Err(e) => warn!(error = %e, "ring publish failed"),
            }
        }
        seq
    }

    pub fn directory(&self) -> &JournalDirectory {
        &self.directory
    }

    pub fn ring(&self) -> Option<&RingPublisher> {
        self.ring.as_ref()
    }

    pub fn stats(&self) -> RecorderStats {
        self.stats
    }

    /// Close every journal and return the final counters.
    pub fn shutdown(self) -> RecorderStats {
        self.directory.close_all();
        if let Some(ring) = &self.ring {
            if let Err(e) = ring.flush() {
                warn!(error = %e, "ring flush failed");
            }
        }
        self.stats
    }
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("directory", &self.directory)
            .field("ring", &self.ring)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Run `recorder` on its own thread until `snapshots` disconnects or a
/// message arrives on `shutdown`. Snapshots already queued when shutdown is
/// requested are still recorded. The thread closes all journals before it
/// returns its counters.
pub fn spawn_recorder(
    mut recorder: Recorder,
    snapshots: Receiver<BookSnapshot>,
    shutdown: Receiver<()>,
) -> std::io::Result<JoinHandle<RecorderStats>> {
    std::thread::Builder::new()
        .name("journal-writer".into())
        .spawn(move || {
            loop {
                select! {
                    recv(snapshots) -> msg => match msg {
                        Ok(snapshot) => {
                            recorder.record(&snapshot);
                        }
                        Err(_) => break,
                    },
                    recv(shutdown) -> _ => {
                        let mut drained = 0u64;
                        while let Ok(snapshot) = snapshots.try_recv() {
                            recorder.record(&snapshot);
                            drained += 1;
                        }
                        info!(drained, "shutdown requested");
                        break;
                    }
                }
            }
            let stats = recorder.shutdown();
            info!(
                received = stats.received,
                journaled = stats.journaled,
                dropped = stats.dropped,
                published = stats.published,
                "recorder stopped"
            );
            stats
        })
}
