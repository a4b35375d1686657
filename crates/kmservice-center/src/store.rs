// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared data store and per-key lock manager.
//!
//! Every access to the shared values goes through [`SharedStore`]. A writer
//! takes the key's exclusive lock with [`SharedStore::try_lock`] and holds the
//! returned [`KeyGuard`] while it checks and replaces the value; the lock is
//! released when the guard drops. Readers never wait: a held lock is reported
//! as [`LockError::Locked`].

use dashmap::{DashMap, DashSet};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Lock manager errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("key {0} is locked")]
    Locked(i64),
}

/// Shared key/value data with per-key write locks.
#[derive(Debug, Default)]
pub struct SharedStore {
    data: DashMap<i64, Value>,
    locks: DashSet<i64>,
}

impl SharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `data`.
    pub fn with_data(data: HashMap<i64, Value>) -> Self {
        Self {
            data: data.into_iter().collect(),
            locks: DashSet::new(),
        }
    }

    /// Current value of `key`, unless a writer holds its lock.
    pub fn get(&self, key: i64) -> Result<Option<Value>, LockError> {
        if self.locks.contains(&key) {
            return Err(LockError::Locked(key));
        }
        Ok(self.data.get(&key).map(|v| v.value().clone()))
    }

    /// Take the exclusive write lock on `key`.
    pub fn try_lock(&self, key: i64) -> Result<KeyGuard<'_>, LockError> {
        if self.locks.insert(key) {
            Ok(KeyGuard { store: self, key })
        } else {
            Err(LockError::Locked(key))
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Exclusive write access to one key. Dropping it releases the lock.
#[derive(Debug)]
pub struct KeyGuard<'a> {
    store: &'a SharedStore,
    key: i64,
}

impl KeyGuard<'_> {
    pub fn key(&self) -> i64 {
        self.key
    }

    pub fn value(&self) -> Option<Value> {
        self.store.data.get(&self.key).map(|v| v.value().clone())
    }

    /// Overwrite the value, returning the previous one.
    pub fn replace(&self, value: Value) -> Option<Value> {
        self.store.data.insert(self.key, value)
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.store.locks.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_get_and_replace() {
        let store = SharedStore::new();
        assert_eq!(store.get(42).unwrap(), None);

        {
            let guard = store.try_lock(42).unwrap();
            assert_eq!(guard.value(), None);
            assert_eq!(guard.replace(json!("v1")), None);
            assert_eq!(guard.replace(json!("v2")), Some(json!("v1")));
        }

        assert_eq!(store.get(42).unwrap(), Some(json!("v2")));
        assert!(store.try_lock(42).is_ok());
    }

    #[test]
    fn test_held_lock_refuses_readers_and_writers() {
        let store = SharedStore::with_data(HashMap::from([(7, json!(1))]));
        let guard = store.try_lock(7).unwrap();

        assert_eq!(store.get(7), Err(LockError::Locked(7)));
        assert_eq!(store.try_lock(7).unwrap_err(), LockError::Locked(7));
        assert_eq!(store.get(8).unwrap(), None);

        drop(guard);
        assert_eq!(store.get(7).unwrap(), Some(json!(1)));
        assert!(store.try_lock(7).is_ok());
    }

    #[test]
    fn test_lock_exclusivity_under_contention() {
        let store = Arc::new(SharedStore::new());
        let holders = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let holders = holders.clone();
                let max_seen = max_seen.clone();
                std::thread::spawn(move || {
                    let mut wins = 0;
                    for _ in 0..500 {
                        if let Ok(guard) = store.try_lock(7) {
                            let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            guard.replace(json!(wins));
                            holders.fetch_sub(1, Ordering::SeqCst);
                            wins += 1;
                        }
                    }
                    wins
                })
            })
            .collect();

        let total: usize = threads.into_iter().map(|t| t.join().unwrap()).sum();
        assert!(total > 0);
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(store.try_lock(7).is_ok());
    }
}
