use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

use crate::config::AppConfig;
use crate::errors::AppResult;

const BUFFER_FILE_STEM: &str = "telemetry-buffer";
const RECENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryKind {
    AppStart,
    SettingsUpdated,
    ImportParsed,
    ImportCommitted,
    RouteSelected,
    RouteDrawn,
    RouteFetchFailed,
    OverlaysCleared,
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    pub kind: TelemetryKind,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Buffers diagnostic events in memory and appends them to a rotating JSONL file.
#[derive(Clone)]
pub struct TelemetryClient {
    enabled: Arc<AtomicBool>,
    queue: Arc<Mutex<Vec<TelemetryEvent>>>,
    recent: Arc<Mutex<VecDeque<TelemetryEvent>>>,
    buffer_path: PathBuf,
    batch_size: usize,
    max_file_bytes: u64,
    max_file_count: usize,
}

impl TelemetryClient {
    pub fn new<P: AsRef<Path>>(data_dir: P, config: &AppConfig) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let buffer_path = data_dir.join(format!("{BUFFER_FILE_STEM}.jsonl"));
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&buffer_path)?;

        Ok(Self {
            enabled: Arc::new(AtomicBool::new(config.telemetry_enabled_by_default)),
            queue: Arc::new(Mutex::new(Vec::new())),
            recent: Arc::new(Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY))),
            buffer_path,
            batch_size: config.telemetry_batch_size.max(1),
            max_file_bytes: config.telemetry_buffer_max_bytes,
            max_file_count: config.telemetry_buffer_max_files,
        })
    }

    pub fn record(&self, kind: TelemetryKind, payload: serde_json::Value) -> AppResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let event = TelemetryEvent {
            kind,
            timestamp: Utc::now(),
            payload,
        };
        trace!(target: "telemetry", ?kind, "event recorded");
        {
            let mut recent = self.recent.lock();
            if recent.len() == RECENT_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }

        let mut queue = self.queue.lock();
        queue.push(event);
        if queue.len() >= self.batch_size {
            self.persist_locked(&mut queue)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut queue = self.queue.lock();
        self.persist_locked(&mut queue)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    /// Most recent events, oldest first, whether or not they were flushed yet.
    pub fn recent(&self) -> Vec<TelemetryEvent> {
        self.recent.lock().iter().cloned().collect()
    }

    pub fn buffer_path(&self) -> &Path {
        &self.buffer_path
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn persist_locked(&self, queue: &mut Vec<TelemetryEvent>) -> AppResult<()> {
        if queue.is_empty() {
            return Ok(());
        }

        let mut chunk = String::new();
        for event in queue.drain(..) {
            chunk.push_str(&serde_json::to_string(&event)?);
            chunk.push('\n');
        }
        self.roll_over_if_full(chunk.len() as u64)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.buffer_path)?
            .write_all(chunk.as_bytes())?;
        Ok(())
    }

    /// Moves a full buffer aside under a timestamped name and keeps at most
    /// `max_file_count - 1` of those around.
    fn roll_over_if_full(&self, pending: u64) -> AppResult<()> {
        let size = fs::metadata(&self.buffer_path).map_or(0, |meta| meta.len());
        if size == 0 || size + pending <= self.max_file_bytes {
            return Ok(());
        }

        let dir = self.buffer_dir();
        if self.max_file_count > 1 {
            let stamp = Utc::now().format("%Y%m%d%H%M%S%3f");
            fs::rename(&self.buffer_path, dir.join(format!("{BUFFER_FILE_STEM}-{stamp}.jsonl")))?;
            let rolled = rolled_files(dir)?;
            let keep = self.max_file_count - 1;
            for stale in rolled.iter().take(rolled.len().saturating_sub(keep)) {
                if let Err(err) = fs::remove_file(stale) {
                    trace!(target: "telemetry", ?err, path = %stale.display(), "could not prune rolled buffer");
                }
            }
        }
        fs::write(&self.buffer_path, b"")?;
        Ok(())
    }

    fn buffer_dir(&self) -> &Path {
        self.buffer_path.parent().unwrap_or_else(|| Path::new("."))
    }
}

/// Rolled buffers, oldest first. The timestamp in the name sorts chronologically.
fn rolled_files(dir: &Path) -> AppResult<Vec<PathBuf>> {
    let prefix = format!("{BUFFER_FILE_STEM}-");
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let rolled = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(".jsonl"));
        if rolled {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn flushed_events_land_in_jsonl() {
        let dir = tempdir().unwrap();
        let client = TelemetryClient::new(dir.path(), &test_config()).unwrap();
        client
            .record(TelemetryKind::RouteSelected, json!({ "route_id": "r1" }))
            .unwrap();
        client.flush().unwrap();

        let lines: Vec<serde_json::Value> = fs::read_to_string(client.buffer_path())
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["kind"], "route_selected");
        assert_eq!(lines[0]["payload"]["route_id"], "r1");
        assert_eq!(client.queue_depth(), 0);
    }

    #[test]
    fn reopened_client_appends() {
        let dir = tempdir().unwrap();
        let first = TelemetryClient::new(dir.path(), &test_config()).unwrap();
        first.record(TelemetryKind::ImportParsed, json!({})).unwrap();
        first.flush().unwrap();
        drop(first);

        let second = TelemetryClient::new(dir.path(), &test_config()).unwrap();
        second.record(TelemetryKind::ImportCommitted, json!({})).unwrap();
        second.flush().unwrap();

        let buffer = fs::read_to_string(second.buffer_path()).unwrap();
        assert_eq!(buffer.lines().count(), 2);
        assert!(buffer.contains("import_parsed") && buffer.contains("import_committed"));
    }

    #[test]
    fn oversized_buffer_rolls_into_timestamped_files() {
        let dir = tempdir().unwrap();
        let config = AppConfig {
            telemetry_buffer_max_bytes: 80,
            telemetry_batch_size: 1,
            telemetry_buffer_max_files: 3,
            ..test_config()
        };
        let client = TelemetryClient::new(dir.path(), &config).unwrap();
        for point in 0..6 {
            client
                .record(
                    TelemetryKind::RouteDrawn,
                    json!({ "route_id": "ruta-con-nombre-largo", "points": point }),
                )
                .unwrap();
        }

        let rolled = rolled_files(dir.path()).unwrap();
        assert!(!rolled.is_empty());
        assert!(rolled.len() <= 2);
        assert!(client.buffer_path().exists());
    }

    #[test]
    fn disabled_client_drops_events() {
        let dir = tempdir().unwrap();
        let client = TelemetryClient::new(dir.path(), &test_config()).unwrap();
        client.set_enabled(false);
        client
            .record(TelemetryKind::OverlaysCleared, json!({}))
            .unwrap();
        assert_eq!(client.queue_depth(), 0);
        assert!(client.recent().is_empty());
    }

    #[test]
    fn recent_keeps_unflushed_events() {
        let dir = tempdir().unwrap();
        let client = TelemetryClient::new(dir.path(), &test_config()).unwrap();
        client
            .record(TelemetryKind::RouteFetchFailed, json!({ "route_id": "r9" }))
            .unwrap();
        assert_eq!(client.queue_depth(), 1);
        let recent = client.recent();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind, TelemetryKind::RouteFetchFailed);
    }
}
