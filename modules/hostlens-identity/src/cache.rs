use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::key::ThreadMetadataKey;

/// Durable id recorded for a key, or the marker that two records collided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "id")]
pub enum RecordId {
    Known(String),
    Ambiguous,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityRecord {
    pub key: ThreadMetadataKey,
    pub id: RecordId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The key already held a concrete id and is now ambiguous.
    FlippedAmbiguous,
    AlreadyAmbiguous,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Missing,
    Concrete(String),
    Ambiguous,
}

/// Key → id cache for one session.
///
/// Nothing is ever evicted and a key that turned ambiguous never becomes
/// concrete again. Share it behind an `Arc` between the ingestor and the
/// resolver.
#[derive(Debug, Default)]
pub struct IdentityCache {
    records: Mutex<HashMap<ThreadMetadataKey, RecordId>>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id` under `key`. Any second insertion under a key flips it to
    /// ambiguous, including a repeat of the same id.
    pub fn insert(&self, key: ThreadMetadataKey, id: impl Into<String>) -> InsertOutcome {
        let mut records = self.records.lock().expect("identity cache lock poisoned");
        match records.get_mut(&key) {
            None => {
                records.insert(key, RecordId::Known(id.into()));
                InsertOutcome::Inserted
            }
            Some(RecordId::Ambiguous) => InsertOutcome::AlreadyAmbiguous,
            Some(existing @ RecordId::Known(_)) => {
                *existing = RecordId::Ambiguous;
                InsertOutcome::FlippedAmbiguous
            }
        }
    }

    pub fn lookup(&self, key: &ThreadMetadataKey) -> Lookup {
        match self
            .records
            .lock()
            .expect("identity cache lock poisoned")
            .get(key)
        {
            None => Lookup::Missing,
            Some(RecordId::Known(id)) => Lookup::Concrete(id.clone()),
            Some(RecordId::Ambiguous) => Lookup::Ambiguous,
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("identity cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ambiguous_count(&self) -> usize {
        self.records
            .lock()
            .expect("identity cache lock poisoned")
            .values()
            .filter(|id| **id == RecordId::Ambiguous)
            .count()
    }

    /// Every record, ordered by key.
    pub fn records(&self) -> Vec<IdentityRecord> {
        let mut records: Vec<IdentityRecord> = self
            .records
            .lock()
            .expect("identity cache lock poisoned")
            .iter()
            .map(|(key, id)| IdentityRecord {
                key: key.clone(),
                id: id.clone(),
            })
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }
}
