//! Per-owner async mutual exclusion

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::models::OwnerId;

/// Serializes work for the same owner while letting different owners run in parallel
#[derive(Debug, Clone, Default)]
pub struct OwnerLocks {
    inner: Arc<Mutex<HashMap<OwnerId, Arc<Mutex<()>>>>>,
}

impl OwnerLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `owner_id`. Released when the guard drops.
    pub async fn acquire(&self, owner_id: &OwnerId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.lock().await;
            // Entries nobody holds or waits on anymore
            locks.retain(|key, lock| key == owner_id || Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(owner_id.clone()).or_default())
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    pub(crate) async fn tracked(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_owner_is_serialized() {
        let locks = OwnerLocks::new();
        let owner = OwnerId::from("a");

        let guard = locks.acquire(&owner).await;
        let contender = locks.clone();
        let waiting_owner = owner.clone();
        let waiter = tokio::spawn(async move {
            let _guard = contender.acquire(&waiting_owner).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_owners_do_not_contend() {
        let locks = OwnerLocks::new();
        let _a = locks.acquire(&OwnerId::from("a")).await;
        let acquired = tokio::time::timeout(
            Duration::from_millis(100),
            locks.acquire(&OwnerId::from("b")),
        )
        .await;
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn test_idle_entries_are_pruned() {
        let locks = OwnerLocks::new();
        drop(locks.acquire(&OwnerId::from("a")).await);
        drop(locks.acquire(&OwnerId::from("b")).await);
        assert_eq!(locks.tracked().await, 1);
    }
}
