//! Bounded log of successful publish cycles.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::info;

/// Default number of entries kept.
pub const DEFAULT_CAPACITY: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Ring buffer of [`HistoryEntry`] values; the oldest entry is evicted
/// once `capacity` is reached.
#[derive(Debug)]
pub struct UploadHistory {
    capacity: usize,
    entries: Mutex<VecDeque<HistoryEntry>>,
}

impl UploadHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, message: impl Into<String>) {
        let entry = HistoryEntry {
            timestamp: Utc::now(),
            message: message.into(),
        };
        info!("Upload history: {} at {}", entry.message, entry.timestamp);

        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Entries oldest first.
    pub fn entries(&self) -> Vec<HistoryEntry> {
        match self.entries.lock() {
            Ok(guard) => guard.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }
}

impl Default for UploadHistory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_first() {
        let history = UploadHistory::new(3);
        for n in 1..=5 {
            history.record(format!("{} annotations", n));
        }

        let messages: Vec<_> = history.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(
            messages,
            vec!["3 annotations", "4 annotations", "5 annotations"]
        );
    }

    #[test]
    fn zero_capacity_keeps_latest() {
        let history = UploadHistory::new(0);
        history.record("1 annotations");
        history.record("2 annotations");

        let entries = history.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "2 annotations");
    }
}
