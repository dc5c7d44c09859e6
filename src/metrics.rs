use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricError {
    #[error("failed to open metric log")]
    Open(#[source] std::io::Error),

    #[error("failed to append metric event")]
    Append(#[source] std::io::Error),

    #[error(transparent)]
    Encode(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunnerInstalled,
    RunnerStart,
    RunnerStop,
    Reconciliation,
}

/// One line in the append-only metric log. `timestamp` is seconds since the
/// Unix epoch at emission time.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    RunnerInstalled {
        timestamp: f64,
        flavor: String,
        instance_id: String,
        duration: f64,
    },
    RunnerStart {
        timestamp: f64,
        flavor: String,
        instance_id: String,
    },
    RunnerStop {
        timestamp: f64,
        flavor: String,
        instance_id: String,
    },
    Reconciliation {
        timestamp: f64,
        flavor: String,
        expected: i64,
        idle: usize,
        active: usize,
        crashed: i64,
        duration: f64,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::RunnerInstalled { .. } => EventKind::RunnerInstalled,
            Event::RunnerStart { .. } => EventKind::RunnerStart,
            Event::RunnerStop { .. } => EventKind::RunnerStop,
            Event::Reconciliation { .. } => EventKind::Reconciliation,
        }
    }
}

pub fn now_timestamp() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_millis()) / 1000.0
}

/// Counts of events issued during one operation, merged up the call chain so
/// the reconciliation summary can report starts and stops per cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetricStats(HashMap<EventKind, u64>);

impl MetricStats {
    pub fn record(&mut self, kind: EventKind) {
        *self.0.entry(kind).or_insert(0) += 1;
    }

    pub fn get(&self, kind: EventKind) -> u64 {
        self.0.get(&kind).copied().unwrap_or(0)
    }

    pub fn merge(&mut self, other: &MetricStats) {
        for (kind, count) in &other.0 {
            *self.0.entry(*kind).or_insert(0) += count;
        }
    }

    pub fn crashed_runners(&self) -> i64 {
        self.get(EventKind::RunnerStart) as i64 - self.get(EventKind::RunnerStop) as i64
    }
}

pub trait MetricSink: Send + Sync {
    fn issue(&self, event: Event) -> Result<(), MetricError>;
}

/// Newline-delimited JSON, one event per line. Appends are serialized behind
/// a mutex so concurrent emitters never interleave lines.
pub struct FileMetricSink {
    file: Mutex<File>,
}

impl FileMetricSink {
    pub fn open(path: &Path) -> Result<Self, MetricError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(MetricError::Open)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl MetricSink for FileMetricSink {
    fn issue(&self, event: Event) -> Result<(), MetricError> {
        let line = serde_json::to_string(&event)?;
        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        writeln!(file, "{line}").map_err(MetricError::Append)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_merge_sums_counts() {
        let mut a = MetricStats::default();
        a.record(EventKind::RunnerStart);
        a.record(EventKind::RunnerStop);
        let mut b = MetricStats::default();
        b.record(EventKind::RunnerStart);
        a.merge(&b);
        assert_eq!(a.get(EventKind::RunnerStart), 2);
        assert_eq!(a.get(EventKind::RunnerStop), 1);
        assert_eq!(a.crashed_runners(), 1);
    }

    #[test]
    fn events_serialize_with_event_tag() {
        let event = Event::Reconciliation {
            timestamp: 12.5,
            flavor: "fleet".to_string(),
            expected: 2,
            idle: 2,
            active: 0,
            crashed: 0,
            duration: 0.8,
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(value["event"], "reconciliation");
        assert_eq!(value["expected"], 2);
        assert_eq!(value["idle"], 2);
    }

    #[test]
    fn file_sink_appends_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.log");
        let sink = FileMetricSink::open(&path).unwrap();
        sink.issue(Event::RunnerStart {
            timestamp: 1.0,
            flavor: "fleet".to_string(),
            instance_id: "fleet-reactive-abcdefgh".to_string(),
        })
        .unwrap();
        sink.issue(Event::RunnerStop {
            timestamp: 2.0,
            flavor: "fleet".to_string(),
            instance_id: "fleet-reactive-abcdefgh".to_string(),
        })
        .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "runner_start");
    }
}
