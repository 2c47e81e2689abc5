//! Durable state: compressed snapshots plus an append-only event log
//!
//! Layout of `state_dir`:
//! - `snapshot-<segment>-<taken_at_ms>.json.zst` - zstd JSON dump of the store
//! - `events-<segment>.jsonl` - one `{topic, payload, timestamp}` per line
//!
//! A new log segment starts at process start and right after every snapshot.
//! Restore loads the newest readable snapshot and replays the retained log on
//! top of it; `state.*` records only apply when their version is newer, so
//! records written around the snapshot boundary are harmless.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::event_bus::{Event, EventBus};
use super::state_store::{StateEntry, StateSnapshot, StateStore, STATE_TOPIC_PREFIX};
use crate::error::EngineError;

const FORMAT_VERSION: u32 = 1;
const SNAPSHOT_PREFIX: &str = "snapshot-";
const SNAPSHOT_SUFFIX: &str = ".json.zst";
const SEGMENT_PREFIX: &str = "events-";
const SEGMENT_SUFFIX: &str = ".jsonl";
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub state_dir: PathBuf,
    pub snapshot_interval_mins: u64,
    pub snapshot_retention: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("state"),
            snapshot_interval_mins: 5,
            snapshot_retention: 12,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    format_version: u32,
    taken_at: DateTime<Utc>,
    log_segment: u64,
    entries: Vec<StateEntry>,
}

/// One line of the event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub topic: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl From<&Event> for LogRecord {
    fn from(event: &Event) -> Self {
        Self {
            topic: event.topic.clone(),
            payload: event.payload.clone(),
            timestamp: event.timestamp,
        }
    }
}

/// What [`StatePersistence::restore`] found on disk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoreReport {
    pub snapshot: Option<PathBuf>,
    pub snapshot_taken_at: Option<DateTime<Utc>>,
    pub entries_restored: usize,
    pub records_replayed: usize,
    pub entries_applied: usize,
    pub corrupt_snapshots: usize,
    pub corrupt_records: usize,
}

struct EventLog {
    segment: u64,
    file: File,
}

impl EventLog {
    fn open(dir: &Path, segment: u64) -> Result<Self> {
        let path = segment_path(dir, segment);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open event log {}", path.display()))?;
        Ok(Self { segment, file })
    }

    fn append(&mut self, record: &LogRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        writeln!(self.file, "{}", line)?;
        self.file.flush()?;
        Ok(())
    }
}

pub struct StatePersistence {
    config: PersistenceConfig,
    store: Arc<StateStore>,
    log: Mutex<EventLog>,
}

impl StatePersistence {
    /// Prepare `state_dir` and start a fresh log segment for this process
    pub fn open(config: PersistenceConfig, store: Arc<StateStore>) -> Result<Self> {
        fs::create_dir_all(&config.state_dir)
            .with_context(|| format!("Failed to create {}", config.state_dir.display()))?;

        let newest_segment = list_segments(&config.state_dir)?
            .into_iter()
            .chain(list_snapshots(&config.state_dir)?.into_iter().map(|(s, _)| s))
            .max()
            .unwrap_or(0);
        let log = EventLog::open(&config.state_dir, newest_segment + 1)?;

        info!(
            dir = %config.state_dir.display(),
            segment = log.segment,
            "State persistence opened"
        );

        Ok(Self {
            config,
            store,
            log: Mutex::new(log),
        })
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    pub fn current_segment(&self) -> u64 {
        self.log.lock().segment
    }

    /// Rebuild the store from the newest readable snapshot plus the log
    pub fn restore(&self) -> Result<RestoreReport> {
        let dir = &self.config.state_dir;
        let mut report = RestoreReport::default();
        let mut first_segment = 0;

        // Newest first
        let mut snapshots = list_snapshots(dir)?;
        snapshots.reverse();

        for (_, path) in snapshots {
            match read_snapshot(&path) {
                Ok(file) => {
                    self.store.restore(&StateSnapshot {
                        taken_at: file.taken_at,
                        entries: file.entries.clone(),
                    });
                    report.entries_restored = file.entries.len();
                    report.snapshot_taken_at = Some(file.taken_at);
                    report.snapshot = Some(path);
                    // The segment before the snapshot may hold records written
                    // after it was captured
                    first_segment = file.log_segment.saturating_sub(1);
                    break;
                }
                Err(e) => {
                    report.corrupt_snapshots += 1;
                    warn!(path = %path.display(), "Skipping unreadable snapshot: {:#}", e);
                }
            }
        }

        for segment in list_segments(dir)?.into_iter().filter(|s| *s >= first_segment) {
            self.replay_segment(segment, &mut report)?;
        }

        info!(
            snapshot = ?report.snapshot,
            entries = report.entries_restored,
            replayed = report.records_replayed,
            applied = report.entries_applied,
            "State restored"
        );
        Ok(report)
    }

    fn replay_segment(&self, segment: u64, report: &mut RestoreReport) -> Result<()> {
        let path = segment_path(&self.config.state_dir, segment);
        let file = File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;

        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let record: LogRecord = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    // Typically a torn final line after a crash
                    report.corrupt_records += 1;
                    warn!(segment, "Skipping unreadable log record: {}", e);
                    continue;
                }
            };

            if report.snapshot_taken_at.is_some_and(|t| record.timestamp < t) {
                continue;
            }
            report.records_replayed += 1;

            if record.topic.starts_with(STATE_TOPIC_PREFIX) {
                match serde_json::from_value::<StateEntry>(record.payload) {
                    Ok(entry) => {
                        if self.store.apply_entry(entry) {
                            report.entries_applied += 1;
                        }
                    }
                    Err(e) => {
                        report.corrupt_records += 1;
                        warn!(topic = %record.topic, "Malformed state record: {}", e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Append one event to the current log segment
    pub fn record_event(&self, event: &Event) -> Result<()> {
        if event.topic == persistence_error_topic() {
            return Ok(());
        }
        self.log.lock().append(&LogRecord::from(event))
    }

    /// Write a snapshot, start a new log segment and prune old files
    pub fn snapshot_now(&self) -> Result<PathBuf> {
        let dir = &self.config.state_dir;

        let (snapshot, segment) = {
            let mut log = self.log.lock();
            let snapshot = self.store.snapshot();
            *log = EventLog::open(dir, log.segment + 1)?;
            (snapshot, log.segment)
        };

        let file = SnapshotFile {
            format_version: FORMAT_VERSION,
            taken_at: snapshot.taken_at,
            log_segment: segment,
            entries: snapshot.entries,
        };
        let json = serde_json::to_vec(&file)?;
        let compressed = zstd::encode_all(&json[..], ZSTD_LEVEL)?;

        let path = dir.join(format!(
            "{}{}-{}{}",
            SNAPSHOT_PREFIX,
            segment,
            file.taken_at.timestamp_millis(),
            SNAPSHOT_SUFFIX
        ));
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, compressed).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("Failed to move snapshot into {}", path.display()))?;

        debug!(path = %path.display(), entries = file.entries.len(), "Snapshot written");
        self.prune()?;
        Ok(path)
    }

    /// Drop snapshots beyond the retention count and log segments no retained
    /// snapshot needs. Returns the number of files removed.
    pub fn prune(&self) -> Result<usize> {
        let dir = &self.config.state_dir;
        let snapshots = list_snapshots(dir)?;
        let retention = self.config.snapshot_retention.max(1);
        let excess = snapshots.len().saturating_sub(retention);
        let mut removed = 0;

        for (_, path) in &snapshots[..excess] {
            fs::remove_file(path).with_context(|| format!("Failed to remove {}", path.display()))?;
            removed += 1;
        }

        let Some((oldest_kept, _)) = snapshots.get(excess) else {
            return Ok(removed);
        };
        let keep_from = oldest_kept.saturating_sub(1);

        for segment in list_segments(dir)?.into_iter().filter(|s| *s < keep_from) {
            fs::remove_file(segment_path(dir, segment))?;
            removed += 1;
        }

        if removed > 0 {
            debug!(removed, "Pruned persistence files");
        }
        Ok(removed)
    }

    /// [`snapshot_now`](Self::snapshot_now) on the blocking pool, so
    /// compression and disk writes never stall a runtime worker
    pub async fn snapshot_in_background(self: &Arc<Self>) -> Result<PathBuf> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.snapshot_now())
            .await
            .context("Snapshot task panicked")?
    }

    /// Start the background writer. Every bus event is queued and appended to
    /// the log; snapshots are taken on the configured interval and once more
    /// after `stop` flips, once the queue is drained.
    pub fn spawn(self: Arc<Self>, bus: Arc<EventBus>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let subscription = bus.subscribe("*", move |event| {
            if event.topic == persistence_error_topic() {
                return Ok(());
            }
            tx.send(event.clone())
                .map_err(|_| anyhow::anyhow!("persistence worker is not running"))
        });

        let period = Duration::from_secs(self.config.snapshot_interval_mins.max(1) * 60);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            info!(interval_secs = period.as_secs(), "Persistence worker started");

            loop {
                tokio::select! {
                    Some(event) = rx.recv() => {
                        if let Err(e) = self.record_event(&event) {
                            report_failure(&bus, "event log append", e);
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.snapshot_in_background().await {
                            report_failure(&bus, "periodic snapshot", e);
                        }
                    }
                    _ = stop.changed() => break,
                }
            }

            bus.unsubscribe(subscription);

            let mut drained = 0;
            while let Ok(event) = rx.try_recv() {
                if let Err(e) = self.record_event(&event) {
                    report_failure(&bus, "event log append", e);
                }
                drained += 1;
            }

            match self.snapshot_in_background().await {
                Ok(path) => info!(drained, path = %path.display(), "Persistence worker stopped"),
                Err(e) => report_failure(&bus, "final snapshot", e),
            }
        })
    }
}

fn persistence_error_topic() -> &'static str {
    EngineError::PersistenceWrite(String::new()).topic()
}

fn report_failure(bus: &EventBus, operation: &str, err: anyhow::Error) {
    warn!(operation, "Persistence write failed: {:#}", err);
    let failure = EngineError::PersistenceWrite(format!("{}: {:#}", operation, err));
    bus.publish(failure.topic(), failure.to_payload(), "persistence");
}

fn read_snapshot(path: &Path) -> Result<SnapshotFile> {
    let compressed = fs::read(path)?;
    let json = zstd::decode_all(&compressed[..])?;
    let file: SnapshotFile = serde_json::from_slice(&json)?;
    if file.format_version != FORMAT_VERSION {
        bail!("unsupported snapshot format version {}", file.format_version);
    }
    Ok(file)
}

fn segment_path(dir: &Path, segment: u64) -> PathBuf {
    dir.join(format!("{}{}{}", SEGMENT_PREFIX, segment, SEGMENT_SUFFIX))
}

/// Snapshot files as `(segment, path)`, oldest first
fn list_snapshots(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut snapshots = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let filename = entry.file_name().to_string_lossy().to_string();
        let segment = filename
            .strip_prefix(SNAPSHOT_PREFIX)
            .and_then(|rest| rest.strip_suffix(SNAPSHOT_SUFFIX))
            .and_then(|stem| stem.split('-').next())
            .and_then(|segment| segment.parse::<u64>().ok());
        if let Some(segment) = segment {
            snapshots.push((segment, entry.path()));
        }
    }

    snapshots.sort();
    Ok(snapshots)
}

/// Log segment numbers, ascending
fn list_segments(dir: &Path) -> Result<Vec<u64>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let filename = entry.file_name().to_string_lossy().to_string();
        if let Some(segment) = filename
            .strip_prefix(SEGMENT_PREFIX)
            .and_then(|rest| rest.strip_suffix(SEGMENT_SUFFIX))
            .and_then(|n| n.parse::<u64>().ok())
        {
            segments.push(segment);
        }
    }

    segments.sort_unstable();
    Ok(segments)
}
