//! Concurrent call record storage

use dashmap::mapref::one::RefMut;
use dashmap::DashMap;

use crate::record::{CallDelta, CallRecord, RecordSeed};

/// In-memory map of call identifier to its evidence record.
///
/// Every mutation runs under the owning shard's write lock, so a
/// get-or-create followed by a merge through the returned guard is atomic
/// with respect to other events for the same call.
#[derive(Debug, Default)]
pub struct CallRecordStore {
    records: DashMap<String, CallRecord>,
}

impl CallRecordStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Returns the record for `call_id`, creating it from `seed` if absent.
    ///
    /// The guard holds the shard lock; drop it before touching the store again.
    pub fn get_or_create(&self, call_id: &str, seed: &RecordSeed) -> RefMut<'_, String, CallRecord> {
        self.records
            .entry(call_id.to_string())
            .or_insert_with(|| CallRecord::new(call_id, seed))
    }

    /// Seeds `call_id` with explicit destination defaults.
    ///
    /// An existing record (created implicitly by an early trace event) keeps
    /// its evidence and only has blank destination fields filled in.
    /// Returns true when a new record was created.
    pub fn seed(&self, call_id: &str, seed: &RecordSeed) -> bool {
        let mut created = false;
        self.records
            .entry(call_id.to_string())
            .and_modify(|record| record.seed_missing(seed))
            .or_insert_with(|| {
                created = true;
                CallRecord::new(call_id, seed)
            });
        created
    }

    /// Applies `delta` to an existing record.
    ///
    /// Returns the number of unique addresses afterwards, or `None` when the
    /// record has already been finalized or never existed.
    pub fn merge(&self, call_id: &str, delta: &CallDelta) -> Option<usize> {
        self.records.get_mut(call_id).map(|mut record| {
            record.apply(delta);
            record.all_detected_ips.len()
        })
    }

    /// Detaches and returns the record for `call_id`.
    pub fn remove(&self, call_id: &str) -> Option<CallRecord> {
        self.records.remove(call_id).map(|(_, record)| record)
    }

    /// Point-in-time copy of every active record.
    pub fn snapshot(&self) -> Vec<(String, CallRecord)> {
        self.records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn get(&self, call_id: &str) -> Option<CallRecord> {
        self.records.get(call_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.records.contains_key(call_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
