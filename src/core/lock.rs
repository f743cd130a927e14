//! Distributed locks on top of the queue store.
//!
//! A lock is a key set to a random holder token with an expiry. Acquisition is
//! set-if-not-exists; release is compare-and-delete, so a holder whose TTL ran
//! out can never delete a lock someone else has since taken.
//!
//! # Example
//!
//! ```rust,no_run
//! # use anvilq::prelude::*;
//! # use std::time::Duration;
//! # async fn example(locks: LockManager) -> AnvilResult<()> {
//! let guard = locks.acquire("nightly-report", Duration::from_secs(30)).await?;
//! // ... critical section ...
//! guard.release().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{AnvilError, AnvilResult};
use crate::queue::TaskQueue;
use std::future::Future;
use std::time::{Duration, Instant};

/// Base backoff between acquisition attempts.
const BACKOFF_BASE: Duration = Duration::from_millis(10);

/// Maximum backoff between acquisition attempts.
const BACKOFF_MAX: Duration = Duration::from_millis(500);

/// Hands out lock guards backed by the shared queue store.
#[derive(Clone)]
pub struct LockManager {
    queue: TaskQueue,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("store", &self.queue.kind())
            .finish()
    }
}

impl LockManager {
    pub fn new(queue: TaskQueue) -> Self {
        Self { queue }
    }

    /// Take `name` for at most `ttl`, or fail with [`AnvilError::LockBusy`].
    pub async fn acquire(&self, name: &str, ttl: Duration) -> AnvilResult<LockGuard> {
        let token = uuid::Uuid::new_v4().to_string();
        if !self.queue.try_lock(name, &token, ttl).await? {
            return Err(AnvilError::LockBusy {
                name: name.to_string(),
            });
        }

        tracing::debug!("Acquired lock '{}' for {:?}", name, ttl);
        Ok(LockGuard {
            queue: self.queue.clone(),
            name: name.to_string(),
            token,
            released: false,
        })
    }

    /// Keep trying to take `name` until `wait` elapses.
    pub async fn acquire_timeout(
        &self,
        name: &str,
        ttl: Duration,
        wait: Duration,
    ) -> AnvilResult<LockGuard> {
        let deadline = Instant::now() + wait;
        let mut backoff = BACKOFF_BASE;

        loop {
            match self.acquire(name, ttl).await {
                Err(AnvilError::LockBusy { .. }) if Instant::now() < deadline => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    tokio::time::sleep(backoff.min(remaining)).await;
                    backoff = backoff.saturating_mul(2).min(BACKOFF_MAX);
                }
                other => return other,
            }
        }
    }

    /// Release `name` if it still holds `token`.
    pub async fn release(&self, name: &str, token: &str) -> AnvilResult<bool> {
        self.queue.unlock(name, token).await
    }

    /// Run `f` while holding `name`. The lock is released on every exit path.
    pub async fn with_lock<F, Fut, T>(&self, name: &str, ttl: Duration, f: F) -> AnvilResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AnvilResult<T>>,
    {
        let guard = self.acquire(name, ttl).await?;
        let result = f().await;
        // The critical section already ran; its outcome stands either way.
        match guard.release().await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!("Lock '{}' expired before its critical section finished", name)
            }
            Err(e) => tracing::warn!("Failed to release lock '{}', it expires with its TTL: {}", name, e),
        }
        result
    }
}

/// A held lock. Dropping it without [`release`](Self::release) spawns a
/// best-effort release.
pub struct LockGuard {
    queue: TaskQueue,
    name: String,
    token: String,
    released: bool,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Random token identifying this holder
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Release now; false if the lock had already expired or changed hands.
    pub async fn release(mut self) -> AnvilResult<bool> {
        self.released = true;
        let released = self.queue.unlock(&self.name, &self.token).await?;
        tracing::debug!("Released lock '{}'", self.name);
        Ok(released)
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let queue = self.queue.clone();
        let name = std::mem::take(&mut self.name);
        let token = std::mem::take(&mut self.token);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = queue.unlock(&name, &token).await {
                        tracing::warn!("Failed to release lock '{}' on drop: {}", name, e);
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    "Lock '{}' dropped outside a runtime, it stays held until its TTL expires",
                    name
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryQueue;
    use crate::queue::testing::FlakyStore;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> LockManager {
        LockManager::new(Arc::new(InMemoryQueue::new()))
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let locks = manager();
        let ttl = Duration::from_secs(10);

        let guard = locks.acquire("report", ttl).await.unwrap();
        let busy = locks.acquire("report", ttl).await;
        assert!(matches!(busy, Err(AnvilError::LockBusy { .. })));

        assert!(guard.release().await.unwrap());
        assert!(locks.acquire("report", ttl).await.is_ok());
    }

    #[tokio::test]
    async fn test_stale_token_cannot_release() {
        let locks = manager();
        let guard = locks.acquire("report", Duration::from_secs(10)).await.unwrap();
        assert!(!locks.release("report", "someone-else").await.unwrap());
        assert!(locks.release("report", guard.token()).await.unwrap());
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let locks = manager();
        {
            let _guard = locks.acquire("report", Duration::from_secs(10)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(locks.acquire("report", Duration::from_secs(10)).await.is_ok());
    }

    #[tokio::test]
    async fn test_acquire_timeout_waits_for_expiry() {
        let locks = manager();
        let _held = locks
            .acquire("report", Duration::from_millis(50))
            .await
            .unwrap();

        let guard = locks
            .acquire_timeout("report", Duration::from_secs(1), Duration::from_secs(1))
            .await;
        assert!(guard.is_ok());

        let busy = locks
            .acquire_timeout("report", Duration::from_secs(1), Duration::from_millis(30))
            .await;
        assert!(matches!(busy, Err(AnvilError::LockBusy { .. })));
    }

    #[tokio::test]
    async fn test_with_lock_serializes_holders() {
        let locks = manager();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let wait = Duration::from_secs(5);
                let guard = locks
                    .acquire_timeout("shared", Duration::from_secs(5), wait)
                    .await?;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                guard.release().await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap());
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);

        let value = locks
            .with_lock("shared", Duration::from_secs(1), || async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert!(locks.acquire("shared", Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_with_lock_keeps_result_when_lock_expired() {
        let locks = manager();
        let value = locks
            .with_lock("report", Duration::from_millis(20), || async {
                tokio::time::sleep(Duration::from_millis(60)).await;
                Ok("done")
            })
            .await
            .unwrap();
        assert_eq!(value, "done");
    }

    #[tokio::test]
    async fn test_with_lock_keeps_result_when_release_fails() {
        let store = Arc::new(FlakyStore::new());
        let locks = LockManager::new(store.clone());

        let value = locks
            .with_lock("report", Duration::from_secs(10), || {
                let store = Arc::clone(&store);
                async move {
                    store.fail("unlock");
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);

        // The lock is still held until its TTL runs out.
        store.heal("unlock");
        let busy = locks.acquire("report", Duration::from_secs(1)).await;
        assert!(matches!(busy, Err(AnvilError::LockBusy { .. })));
    }

    #[tokio::test]
    async fn test_with_lock_passes_handler_error_through() {
        let store = Arc::new(FlakyStore::new());
        store.fail("unlock");
        let locks = LockManager::new(store.clone());

        let result: AnvilResult<()> = locks
            .with_lock("report", Duration::from_secs(10), || async {
                Err(AnvilError::permanent("bad input"))
            })
            .await;
        assert!(matches!(result, Err(AnvilError::PermanentExecution { .. })));
    }
}
