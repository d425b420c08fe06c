//! Bounded memory of keys that recently left the cache.
//!
//! Only keys and their terminal state are kept, so `record_state` can tell an
//! evicted or wasted key from one that was never seen.

use std::collections::VecDeque;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::{CacheKey, CacheRecordState};

#[derive(Debug)]
pub(crate) struct GhostList {
    capacity: usize,
    inner: Mutex<GhostInner>,
}

#[derive(Debug, Default)]
struct GhostInner {
    states: FxHashMap<CacheKey, CacheRecordState>,
    /// Front = oldest departure.
    order: VecDeque<CacheKey>,
}

impl GhostList {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(GhostInner::default()),
        }
    }

    /// Remembers that `key` departed in `state`, forgetting the oldest
    /// departure when full.
    pub(crate) fn remember(&self, key: CacheKey, state: CacheRecordState) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.states.insert(key, state).is_some() {
            inner.order.retain(|k| *k != key);
        } else if inner.states.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.states.remove(&oldest);
            }
        }
        inner.order.push_back(key);
    }

    pub(crate) fn get(&self, key: &CacheKey) -> Option<CacheRecordState> {
        self.inner.lock().states.get(key).copied()
    }

    pub(crate) fn forget(&self, key: &CacheKey) {
        let mut inner = self.inner.lock();
        if inner.states.remove(key).is_some() {
            inner.order.retain(|k| k != key);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().states.len()
    }

    pub(crate) fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.states.clear();
        inner.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheScope;

    fn key(hash: u64) -> CacheKey {
        CacheKey::new(hash, CacheScope::GLOBAL)
    }

    #[test]
    fn test_ghost_list_forgets_oldest_when_full() {
        // Arrange
        let ghosts = GhostList::new(2);

        // Act
        ghosts.remember(key(1), CacheRecordState::Evicted);
        ghosts.remember(key(2), CacheRecordState::Wasted);
        ghosts.remember(key(3), CacheRecordState::Evicted);

        // Assert
        assert_eq!(ghosts.len(), 2);
        assert_eq!(ghosts.get(&key(1)), None);
        assert_eq!(ghosts.get(&key(2)), Some(CacheRecordState::Wasted));
        assert_eq!(ghosts.get(&key(3)), Some(CacheRecordState::Evicted));
    }

    #[test]
    fn test_ghost_list_update_refreshes_position() {
        let ghosts = GhostList::new(2);
        ghosts.remember(key(1), CacheRecordState::Wasted);
        ghosts.remember(key(2), CacheRecordState::Wasted);

        ghosts.remember(key(1), CacheRecordState::Evicted);
        ghosts.remember(key(3), CacheRecordState::Wasted);

        assert_eq!(ghosts.get(&key(1)), Some(CacheRecordState::Evicted));
        assert_eq!(ghosts.get(&key(2)), None);
    }

    #[test]
    fn test_ghost_list_forget_and_clear() {
        let ghosts = GhostList::new(4);
        ghosts.remember(key(1), CacheRecordState::Evicted);
        ghosts.remember(key(2), CacheRecordState::Evicted);

        ghosts.forget(&key(1));
        assert_eq!(ghosts.get(&key(1)), None);
        assert_eq!(ghosts.len(), 1);

        ghosts.clear();
        assert_eq!(ghosts.len(), 0);
    }

    #[test]
    fn test_zero_capacity_remembers_nothing() {
        let ghosts = GhostList::new(0);

        ghosts.remember(key(1), CacheRecordState::Evicted);

        assert_eq!(ghosts.len(), 0);
    }
}
