//! Candidate store
//!
//! The only mutable structure shared during orchestration. Slots are created
//! up front, one per photo and per cluster, each behind its own lock, so
//! concurrent appends for unrelated photos never contend.

use crate::types::{RawResponse, SourceRef, TagCandidate};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Everything collected for one photo or cluster
#[derive(Debug, Default, Clone)]
pub struct SlotContents {
    pub candidates: Vec<TagCandidate>,
    /// Why a contributing request did not produce usable output
    pub degraded: Vec<String>,
    pub responses: Vec<RawResponse>,
}

/// Keyed, per-slot locked candidate store
pub struct CandidateStore {
    slots: HashMap<SourceRef, Mutex<SlotContents>>,
}

impl CandidateStore {
    /// Create a store with one slot per key
    pub fn new(keys: impl IntoIterator<Item = SourceRef>) -> Self {
        Self {
            slots: keys
                .into_iter()
                .map(|key| (key, Mutex::new(SlotContents::default())))
                .collect(),
        }
    }

    fn with_slot<R>(&self, key: &SourceRef, f: impl FnOnce(&mut SlotContents) -> R) -> Option<R> {
        let slot = self.slots.get(key)?;
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        Some(f(&mut guard))
    }

    /// Append candidates; unknown keys are ignored and reported as `false`
    pub fn append(&self, key: &SourceRef, candidates: Vec<TagCandidate>) -> bool {
        self.with_slot(key, |slot| slot.candidates.extend(candidates))
            .is_some()
    }

    pub fn mark_degraded(&self, key: &SourceRef, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.with_slot(key, |slot| slot.degraded.push(reason)).is_some()
    }

    pub fn record_response(&self, key: &SourceRef, response: RawResponse) -> bool {
        self.with_slot(key, |slot| slot.responses.push(response))
            .is_some()
    }

    /// Copy of one slot's contents
    pub fn snapshot(&self, key: &SourceRef) -> SlotContents {
        self.with_slot(key, |slot| slot.clone()).unwrap_or_default()
    }

    /// Candidates of one slot
    pub fn candidates(&self, key: &SourceRef) -> Vec<TagCandidate> {
        self.with_slot(key, |slot| slot.candidates.clone())
            .unwrap_or_default()
    }

    /// Consume the store into plain slot contents
    pub fn into_contents(self) -> HashMap<SourceRef, SlotContents> {
        self.slots
            .into_iter()
            .map(|(key, slot)| (key, slot.into_inner().unwrap_or_else(PoisonError::into_inner)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClusterId, PhotoId, TagSource};
    use std::sync::Arc;

    fn photo_key(id: &str) -> SourceRef {
        SourceRef::Photo(PhotoId::new(id))
    }

    fn candidate(tag: &str, key: &SourceRef) -> TagCandidate {
        TagCandidate::new(tag, TagSource::PhotoAi, key.clone(), 0.7).unwrap()
    }

    #[test]
    fn test_append_and_snapshot() {
        let a = photo_key("a");
        let store = CandidateStore::new([a.clone()]);

        assert!(store.append(&a, vec![candidate("beach", &a)]));
        assert!(store.mark_degraded(&a, "timeout"));

        let slot = store.snapshot(&a);
        assert_eq!(slot.candidates.len(), 1);
        assert_eq!(slot.degraded, vec!["timeout".to_string()]);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let store = CandidateStore::new([photo_key("a")]);
        let stray = SourceRef::Cluster(ClusterId::numbered(9));
        assert!(!store.append(&stray, vec![]));
        assert!(store.snapshot(&stray).candidates.is_empty());
    }

    #[test]
    fn test_concurrent_appends() {
        let keys: Vec<SourceRef> = (0..8).map(|i| photo_key(&format!("p{}", i))).collect();
        let store = Arc::new(CandidateStore::new(keys.clone()));

        let handles: Vec<_> = keys
            .iter()
            .cloned()
            .map(|key| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for n in 0..50 {
                        store.append(&key, vec![candidate(&format!("tag {}", n), &key)]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for key in &keys {
            assert_eq!(store.candidates(key).len(), 50);
        }
    }
}
