use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Process-wide serialization of state-mutating reconcile bodies. The lock is
/// injected into everything that mutates the fleet (scaler, HTTP handlers,
/// reactive consumers); read-only status queries do not take it.
#[derive(Clone, Default)]
pub struct ReconcileLock {
    inner: Arc<Mutex<()>>,
}

impl ReconcileLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) -> OwnedMutexGuard<()> {
        self.inner.clone().lock_owned().await
    }

    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serializes_holders() {
        let lock = ReconcileLock::new();
        let guard = lock.acquire().await;
        assert!(lock.is_locked());
        drop(guard);
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn clones_share_the_same_lock() {
        let lock = ReconcileLock::new();
        let clone = lock.clone();
        let _guard = lock.acquire().await;
        assert!(clone.is_locked());
    }
}
