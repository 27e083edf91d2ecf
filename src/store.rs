//! Shared annotation store.
//!
//! A single mutex guards the IP → record map.  Discovery upserts one record
//! per lock acquisition; the publisher holds the lock for an entire
//! read-upload-clear pass through a [`Drain`] so that no upsert can land
//! between the read and the clear.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use crate::types::AnnotationRecord;

#[derive(Debug, Clone, Default)]
pub struct AnnotationStore {
    inner: Arc<Mutex<HashMap<String, AnnotationRecord>>>,
}

impl AnnotationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any record held for `record.ip`.
    pub async fn upsert(&self, record: AnnotationRecord) {
        let mut map = self.inner.lock().await;
        map.insert(record.ip.clone(), record);
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Returns every record and empties the store in one critical section.
    pub async fn snapshot_and_clear(&self) -> HashMap<String, AnnotationRecord> {
        let mut map = self.inner.lock().await;
        std::mem::take(&mut *map)
    }

    /// Locks the store for a publish pass.
    ///
    /// The lock is held until the returned [`Drain`] is dropped or
    /// committed.  Dropping it without [`Drain::commit`] leaves every record
    /// in place for the next attempt.
    pub async fn drain(&self) -> Drain<'_> {
        Drain {
            guard: self.inner.lock().await,
        }
    }
}

/// Exclusive view of the store for the duration of one publish attempt.
pub struct Drain<'a> {
    guard: MutexGuard<'a, HashMap<String, AnnotationRecord>>,
}

impl Drain<'_> {
    pub fn len(&self) -> usize {
        self.guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard.is_empty()
    }

    /// Records currently held, in no particular order.
    pub fn records(&self) -> impl Iterator<Item = &AnnotationRecord> {
        self.guard.values()
    }

    /// Clears the store and releases the lock, returning the number of
    /// records removed.
    pub fn commit(mut self) -> usize {
        let drained = self.guard.len();
        self.guard.clear();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ip: &str, name: &str) -> AnnotationRecord {
        AnnotationRecord {
            ip: ip.into(),
            name: Some(name.into()),
            host: Some("esxi1".into()),
            datastore: None,
            port_group: None,
        }
    }

    #[tokio::test]
    async fn last_write_wins() {
        let store = AnnotationStore::new();
        store.upsert(record("10.0.0.5", "web1")).await;
        store.upsert(AnnotationRecord {
            host: None,
            ..record("10.0.0.5", "web2")
        })
        .await;

        let snapshot = store.snapshot_and_clear().await;
        assert_eq!(snapshot.len(), 1);
        let held = &snapshot["10.0.0.5"];
        assert_eq!(held.name.as_deref(), Some("web2"));
        // no merge with the earlier write
        assert_eq!(held.host, None);
    }

    #[tokio::test]
    async fn snapshot_and_clear_empties_store() {
        let store = AnnotationStore::new();
        store.upsert(record("10.0.0.5", "web1")).await;
        store.upsert(record("10.0.0.6", "web2")).await;

        let snapshot = store.snapshot_and_clear().await;
        assert_eq!(snapshot.len(), 2);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn dropped_drain_keeps_records() {
        let store = AnnotationStore::new();
        store.upsert(record("10.0.0.5", "web1")).await;

        {
            let drain = store.drain().await;
            assert_eq!(drain.len(), 1);
        }

        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn committed_drain_clears_records() {
        let store = AnnotationStore::new();
        store.upsert(record("10.0.0.5", "web1")).await;
        store.upsert(record("10.0.0.6", "web2")).await;

        let drain = store.drain().await;
        assert_eq!(drain.commit(), 2);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn upsert_waits_for_drain() {
        let store = AnnotationStore::new();
        store.upsert(record("10.0.0.5", "web1")).await;

        let drain = store.drain().await;
        let writer = {
            let store = store.clone();
            tokio::spawn(async move { store.upsert(record("10.0.0.6", "web2")).await })
        };
        tokio::task::yield_now().await;
        assert!(!writer.is_finished());

        assert_eq!(drain.commit(), 1);
        writer.await.unwrap();

        let snapshot = store.snapshot_and_clear().await;
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key("10.0.0.6"));
    }
}
