/// Keyed in-process locks serializing mutations of one card (or one order
/// file, or one project config) at a time.
///
/// Waiters queue in FIFO order (tokio's mutex is fair). The guard releases on
/// drop, so every exit path of a critical section unlocks, including `?`
/// returns and panics. Entries nobody holds or waits for are pruned.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    Card { project: String, slug: String },
    LaneOrder { project: String, lane: String },
    ProjectConfig { project: String },
}

impl LockKey {
    pub fn card(project: &str, slug: &str) -> Self {
        LockKey::Card {
            project: project.to_string(),
            slug: slug.to_string(),
        }
    }

    pub fn lane_order(project: &str, lane: &str) -> Self {
        LockKey::LaneOrder {
            project: project.to_string(),
            lane: lane.to_string(),
        }
    }

    pub fn project_config(project: &str) -> Self {
        LockKey::ProjectConfig {
            project: project.to_string(),
        }
    }
}

type LockMap = Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>;

#[derive(Default)]
pub struct LockRegistry {
    locks: Arc<LockMap>,
}

/// Release handle returned by [`LockRegistry::acquire`].
pub struct LockGuard {
    key: LockKey,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn acquire(&self, key: LockKey) -> LockGuard {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let guard = mutex.lock_owned().await;
        LockGuard {
            key,
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    /// Number of keys currently held or waited on.
    pub fn active_keys(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map itself still references the mutex: nobody is queued.
        if locks
            .get(&self.key)
            .is_some_and(|m| Arc::strong_count(m) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_free_key_acquires_immediately() {
        let registry = LockRegistry::new();
        let guard = tokio::time::timeout(
            Duration::from_millis(100),
            registry.acquire(LockKey::card("p", "a")),
        )
        .await
        .expect("free key should not block");
        assert_eq!(registry.active_keys(), 1);
        drop(guard);
        assert_eq!(registry.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_same_key_blocks_until_release() {
        let registry = Arc::new(LockRegistry::new());
        let guard = registry.acquire(LockKey::card("p", "a")).await;

        let r = registry.clone();
        let waiter = tokio::spawn(async move {
            let _g = r.acquire(LockKey::card("p", "a")).await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should run after release")
            .unwrap();
        assert_eq!(registry.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let registry = LockRegistry::new();
        let _a = registry.acquire(LockKey::card("p", "a")).await;
        let _b = tokio::time::timeout(
            Duration::from_millis(100),
            registry.acquire(LockKey::card("p", "b")),
        )
        .await
        .expect("unrelated card must not wait");
        let _o = tokio::time::timeout(
            Duration::from_millis(100),
            registry.acquire(LockKey::lane_order("p", "01-upcoming")),
        )
        .await
        .expect("order lock is a separate key");
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let registry = Arc::new(LockRegistry::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = registry.acquire(LockKey::card("p", "a")).await;

        let mut handles = Vec::new();
        for i in 0..5 {
            let r = registry.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _g = r.acquire(LockKey::card("p", "a")).await;
                order.lock().unwrap().push(i);
            }));
            // Let each waiter enqueue before spawning the next.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(first);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_released_on_error_path() {
        let registry = LockRegistry::new();

        async fn failing(registry: &LockRegistry) -> Result<(), &'static str> {
            let _guard = registry.acquire(LockKey::card("p", "a")).await;
            Err("boom")
        }

        assert!(failing(&registry).await.is_err());
        assert_eq!(registry.active_keys(), 0);
        let _again = tokio::time::timeout(
            Duration::from_millis(100),
            registry.acquire(LockKey::card("p", "a")),
        )
        .await
        .expect("lock must be free after an error");
    }
}
