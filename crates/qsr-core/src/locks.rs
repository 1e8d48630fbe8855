//! Named async locks for serializing mutations over documents and entities.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A table of async mutexes keyed by string, created on first use.
///
/// Acquire multiple keys only through [`KeyedLocks::lock_many`], which takes
/// them in sorted order so two callers can never deadlock on each other.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    table: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Holds one or more keys until dropped.
#[derive(Debug)]
pub struct LockSet {
    keys: BTreeSet<String>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl LockSet {
    pub fn keys(&self) -> &BTreeSet<String> {
        &self.keys
    }

    pub fn covers<'a>(&self, keys: impl IntoIterator<Item = &'a String>) -> bool {
        keys.into_iter().all(|k| self.keys.contains(k))
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.table.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn slot(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut table = self.table();
        // Drop entries nobody holds or waits on.
        table.retain(|_, m| Arc::strong_count(m) > 1);
        table
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn lock(&self, key: &str) -> LockSet {
        let guard = self.slot(key).lock_owned().await;
        LockSet {
            keys: BTreeSet::from([key.to_string()]),
            _guards: vec![guard],
        }
    }

    /// Lock every key in sorted order. Duplicates are collapsed.
    pub async fn lock_many<I, S>(&self, keys: I) -> LockSet
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: BTreeSet<String> = keys.into_iter().map(Into::into).collect();
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.slot(key).lock_owned().await);
        }
        LockSet {
            keys,
            _guards: guards,
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        let mut table = self.table();
        table.retain(|_, m| Arc::strong_count(m) > 1);
        table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::new());
        let held = locks.lock("doc:A").await;

        let other = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock("doc:A").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!other.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), other)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("doc:A").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("doc:B")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn opposite_orders_do_not_deadlock() {
        let locks = Arc::new(KeyedLocks::new());
        let mut tasks = Vec::new();
        for i in 0..20 {
            let locks = locks.clone();
            tasks.push(tokio::spawn(async move {
                let keys = if i % 2 == 0 { ["x", "y"] } else { ["y", "x"] };
                let set = locks.lock_many(keys).await;
                tokio::task::yield_now().await;
                assert_eq!(set.keys().len(), 2);
            }));
        }
        tokio::time::timeout(Duration::from_secs(2), futures::future::join_all(tasks))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn released_entries_are_pruned() {
        let locks = KeyedLocks::new();
        {
            let set = locks.lock_many(["a", "b", "a"]).await;
            assert_eq!(set.keys().len(), 2);
            assert!(set.covers(&["a".to_string()]));
            assert_eq!(locks.len(), 2);
        }
        assert!(locks.is_empty());
    }
}
