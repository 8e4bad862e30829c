//! Fire-and-forget outputs for operator events and periodic statistics.
//! Sinks never fail towards the session; write errors are logged and dropped.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use park_proto::event::LogEntry;
use park_proto::stats::StatsSnapshot;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::controller::lock;
use crate::now_unix_ms;

pub trait EventSink: Send + Sync {
    fn record(&self, message: &str);
}

pub trait StatsSink: Send + Sync {
    fn record_snapshot(&self, snapshot: &StatsSnapshot);
}

/// Forwards events to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, message: &str) {
        info!(target: "parkwatch::events", "{}", message);
    }
}

/// Bounded in-memory log, newest last.
#[derive(Debug)]
pub struct MemoryLog {
    cap: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl MemoryLog {
    pub fn new(cap: usize) -> Self {
        Self { cap: cap.max(1), entries: Mutex::new(VecDeque::new()) }
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        lock(&self.entries).iter().cloned().collect()
    }

    pub fn messages(&self) -> Vec<String> {
        lock(&self.entries).iter().map(|e| e.message.clone()).collect()
    }
}

impl EventSink for MemoryLog {
    fn record(&self, message: &str) {
        let mut entries = lock(&self.entries);
        if entries.len() == self.cap {
            entries.pop_front();
        }
        entries.push_back(LogEntry { ts_unix_ms: now_unix_ms(), message: message.to_string() });
    }
}

/// Append-only text log, one `[YYYY-MM-DD HH:MM:SS] message` line per event (UTC).
#[derive(Debug)]
pub struct FileLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileLog {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn format_line(at: OffsetDateTime, message: &str) -> String {
    let stamp = at
        .format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .unwrap_or_else(|_| at.unix_timestamp().to_string());
    format!("[{stamp}] {message}")
}

impl EventSink for FileLog {
    fn record(&self, message: &str) {
        let line = format_line(OffsetDateTime::now_utc(), message);
        if let Err(e) = writeln!(lock(&self.file), "{line}") {
            warn!("event log {}: {}", self.path.display(), e);
        }
    }
}

/// Sends every event to each inner sink in order.
#[derive(Default, Clone)]
pub struct Fanout(pub Vec<Arc<dyn EventSink>>);

impl EventSink for Fanout {
    fn record(&self, message: &str) {
        for sink in &self.0 {
            sink.record(message);
        }
    }
}

/// Statistics as JSON lines.
#[derive(Debug)]
pub struct JsonLinesStats {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesStats {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file: Mutex::new(file) })
    }
}

impl StatsSink for JsonLinesStats {
    fn record_snapshot(&self, snapshot: &StatsSnapshot) {
        let line = match serde_json::to_string(snapshot) {
            Ok(l) => l,
            Err(e) => {
                warn!("stats encode: {}", e);
                return;
            }
        };
        if let Err(e) = writeln!(lock(&self.file), "{line}") {
            warn!("stats log {}: {}", self.path.display(), e);
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStats {
    snapshots: Mutex<Vec<StatsSnapshot>>,
}

impl MemoryStats {
    pub fn snapshots(&self) -> Vec<StatsSnapshot> {
        lock(&self.snapshots).clone()
    }
}

impl StatsSink for MemoryStats {
    fn record_snapshot(&self, snapshot: &StatsSnapshot) {
        lock(&self.snapshots).push(snapshot.clone());
    }
}
