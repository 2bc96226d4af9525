//! Bounded log of lifecycle events, kept for introspection tooling.

use std::collections::VecDeque;

use forge_query_core::QueryKey;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

/// Default number of retained log entries.
pub const DEFAULT_MAX_LOGS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Fetch,
    Success,
    Error,
    Cache,
    Invalidate,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry<T> {
    pub id: Uuid,
    pub timestamp: u64,
    pub kind: LogKind,
    pub key: QueryKey,
    pub message: String,
    pub data: Option<T>,
    pub error: Option<String>,
}

/// Ring of the most recent `max` entries; `max == 0` keeps nothing.
///
/// Every entry is also emitted as a `tracing` debug event.
#[derive(Debug)]
pub struct EventLog<T> {
    max: usize,
    entries: Mutex<VecDeque<LogEntry<T>>>,
}

impl<T: Clone> EventLog<T> {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            entries: Mutex::new(VecDeque::with_capacity(max.min(DEFAULT_MAX_LOGS))),
        }
    }

    pub fn push(&self, entry: LogEntry<T>) {
        debug!(
            kind = ?entry.kind,
            key = %entry.key,
            error = entry.error.as_deref(),
            "{}",
            entry.message
        );
        if self.max == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        entries.push_back(entry);
        while entries.len() > self.max {
            entries.pop_front();
        }
    }

    /// Oldest first.
    pub fn entries(&self) -> Vec<LogEntry<T>> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: u64) -> LogEntry<u64> {
        LogEntry {
            id: Uuid::new_v4(),
            timestamp: n,
            kind: LogKind::Cache,
            key: QueryKey::from("k"),
            message: format!("entry {n}"),
            data: Some(n),
            error: None,
        }
    }

    #[test]
    fn test_keeps_most_recent_entries() {
        let log = EventLog::new(3);
        for n in 0..5 {
            log.push(entry(n));
        }
        let kept: Vec<u64> = log.entries().iter().map(|e| e.timestamp).collect();
        assert_eq!(kept, vec![2, 3, 4]);
    }

    #[test]
    fn test_zero_capacity_disables_log() {
        let log = EventLog::new(0);
        log.push(entry(1));
        assert!(log.is_empty());
    }

    #[test]
    fn test_kind_serializes_lowercase() {
        let json = serde_json::to_string(&entry(1)).unwrap();
        assert!(json.contains("\"kind\":\"cache\""));
    }
}
