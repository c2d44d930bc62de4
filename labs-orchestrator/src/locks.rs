//! Per-target mutual exclusion.
//!
//! Every status change and its broadcast for one entity happen while holding
//! that entity's lock, which keeps per-entity event order equal to commit
//! order. Locks are never nested: release an attendee lock before taking its
//! workshop's.

use crate::task::TargetKind;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
    pub kind: TargetKind,
    pub id: String,
}

impl TargetKey {
    pub fn workshop(id: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Workshop,
            id: id.into(),
        }
    }

    pub fn attendee(id: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Attendee,
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TargetLocks {
    slots: Arc<Mutex<HashMap<TargetKey, Arc<AsyncMutex<()>>>>>,
}

impl TargetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: TargetKey) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            if slots.len() >= PRUNE_THRESHOLD {
                slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            }
            slots.entry(key).or_default().clone()
        };
        slot.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
