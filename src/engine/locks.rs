use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::models::TallyKey;

/// One async mutex per tally key.
///
/// Every writer touching results of a key (linking, transitions, group
/// resolution) holds the key's guard for the whole transaction. Duplicate
/// groups never span keys, so this also serializes work on a group. The guard
/// must be taken before a store connection is acquired.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<TallyKey, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &TallyKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            // Nobody else holds or waits on these
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Category, ResultSource};
    use std::time::Duration;

    fn key(center: &str) -> TallyKey {
        TallyKey {
            polling_center_id: center.into(),
            category: Category::President,
            source: ResultSource::Internal,
        }
    }

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock(&key("C1")).await;

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock(&key("C1")).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_other_keys_do_not_block_and_idle_locks_are_pruned() {
        let locks = KeyedLocks::new();
        let _c1 = locks.lock(&key("C1")).await;
        let c2 = locks.lock(&key("C2")).await;
        assert_eq!(locks.len(), 2);

        drop(c2);
        let _c3 = locks.lock(&key("C3")).await;
        assert_eq!(locks.len(), 2);
    }
}
