//! Bounded record buffer, running statistics and acknowledgment state.
//!
//! The aggregator is the only owner of records once they are parsed. All
//! operations take the same lock, so appends, acknowledgments and evictions
//! are linearized: an acknowledgment racing with the eviction of the same
//! record either lands before the eviction (found) or after it (not found).

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::model::{LogEntry, Record, Statistics};

/// Default number of records kept in memory.
pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct AggregatorConfig {
    /// Maximum number of records retained (N). Values below 1 are raised to 1.
    pub capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Result of [`Aggregator::acknowledge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The record transitioned from unacknowledged to acknowledged.
    Acknowledged(DateTime<Utc>),
    /// The record was already acknowledged; nothing changed.
    AlreadyAcknowledged(DateTime<Utc>),
    /// No record with that id is currently held (never existed or evicted).
    NotFound,
}

impl AckOutcome {
    pub fn is_found(&self) -> bool {
        !matches!(self, AckOutcome::NotFound)
    }
}

/// Consistent point-in-time view of statistics and retained records.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub stats: Statistics,
    /// Oldest first.
    pub records: Vec<Record>,
    pub capacity: usize,
}

struct Inner {
    next_id: u64,
    records: VecDeque<Record>,
    stats: Statistics,
}

pub struct Aggregator {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(AggregatorConfig::default())
    }
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                next_id: 1,
                records: VecDeque::with_capacity(capacity),
                stats: Statistics::default(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Store a parsed entry under the next id and update counters.
    pub fn append(&self, entry: LogEntry) -> Record {
        self.append_then(entry, |_| {})
    }

    /// Like [`append`](Self::append), but runs `publish` on the new record
    /// before the lock is released. Callers that fan records out use this so
    /// the fan-out order matches the id order.
    pub fn append_then<F>(&self, entry: LogEntry, publish: F) -> Record
    where
        F: FnOnce(&Record),
    {
        let mut inner = self.lock();

        let id = inner.next_id;
        inner.next_id += 1;
        inner.stats.count(entry.level);

        let record = Record {
            id,
            entry,
            acknowledged: false,
            acknowledged_at: None,
        };

        if inner.records.len() >= self.capacity {
            if let Some(evicted) = inner.records.pop_front() {
                debug!(id = evicted.id, "evicted record from buffer");
            }
        }
        inner.records.push_back(record.clone());

        publish(&record);
        record
    }

    /// Mark the record `id` as acknowledged at `at`.
    ///
    /// The first acknowledgment wins: repeating it leaves the flag and the
    /// stored time untouched and reports [`AckOutcome::AlreadyAcknowledged`].
    pub fn acknowledge(&self, id: u64, at: DateTime<Utc>) -> AckOutcome {
        let mut inner = self.lock();
        let Some(record) = find_mut(&mut inner.records, id) else {
            return AckOutcome::NotFound;
        };
        if record.acknowledged {
            return AckOutcome::AlreadyAcknowledged(record.acknowledged_at.unwrap_or(at));
        }
        record.acknowledged = true;
        record.acknowledged_at = Some(at);
        AckOutcome::Acknowledged(at)
    }

    pub fn stats(&self) -> Statistics {
        self.lock().stats
    }

    /// Up to `limit` most recent records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Record> {
        let inner = self.lock();
        let skip = inner.records.len().saturating_sub(limit);
        inner.records.iter().skip(skip).cloned().collect()
    }

    pub fn get(&self, id: u64) -> Option<Record> {
        let inner = self.lock();
        let idx = position(&inner.records, id)?;
        inner.records.get(idx).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Snapshot {
        let inner = self.lock();
        Snapshot {
            stats: inner.stats,
            records: inner.records.iter().cloned().collect(),
            capacity: self.capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every mutation completes before the guard drops, so a poisoned
        // lock still holds consistent state.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Ids are strictly increasing from front to back, so a binary search works.
fn position(records: &VecDeque<Record>, id: u64) -> Option<usize> {
    records.binary_search_by_key(&id, |r| r.id).ok()
}

fn find_mut(records: &mut VecDeque<Record>, id: u64) -> Option<&mut Record> {
    let idx = position(records, id)?;
    records.get_mut(idx)
}
