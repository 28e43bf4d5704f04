//! Process-wide lock around device-touching fingerprint work.
//!
//! Terminals cannot multiplex command streams, so every fingerprint change
//! and every sync device visit runs under this one lock. Waiters are served
//! in FIFO order; the guard releases on drop.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{Result, SyncError};

#[derive(Clone, Default)]
pub struct FingerprintLock {
    inner: Arc<Mutex<()>>,
}

/// Held while a device interaction is in progress.
pub struct FingerprintGuard {
    _guard: OwnedMutexGuard<()>,
}

impl FingerprintLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait as long as it takes.
    pub async fn acquire_global(&self) -> FingerprintGuard {
        let guard = self.inner.clone().lock_owned().await;
        debug!("Fingerprint lock acquired");
        FingerprintGuard { _guard: guard }
    }

    /// Wait at most `limit`, then fail with `LockTimeout`.
    pub async fn acquire_with_timeout(&self, limit: Duration) -> Result<FingerprintGuard> {
        match tokio::time::timeout(limit, self.acquire_global()).await {
            Ok(guard) => Ok(guard),
            Err(_) => Err(SyncError::LockTimeout(limit)),
        }
    }

    /// Bounded when `limit` is set, unbounded otherwise.
    pub async fn acquire(&self, limit: Option<Duration>) -> Result<FingerprintGuard> {
        match limit {
            Some(limit) => self.acquire_with_timeout(limit).await,
            None => Ok(self.acquire_global().await),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}
