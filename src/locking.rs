//! 按资源名划分的内存写锁。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time;

/// Manages asynchronous mutexes keyed by resource name.
///
/// The inner locks are created lazily; the map itself is only held while a
/// lock handle is looked up, never while waiting on a resource lock.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在给定超时时间内获取资源锁，超时返回 None。
    pub async fn lock_with_timeout(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        time::timeout(timeout, lock.lock_owned()).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn same_key_waits_until_timeout() {
        let manager = LockManager::new();
        let _held = manager
            .lock_with_timeout("masters", Duration::from_secs(1))
            .await
            .expect("first lock");
        let second = manager
            .lock_with_timeout("masters", Duration::from_secs(1))
            .await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let manager = LockManager::new();
        let _masters = manager
            .lock_with_timeout("masters", Duration::from_secs(1))
            .await
            .expect("masters lock");
        let faq = manager
            .lock_with_timeout("faq", Duration::from_secs(1))
            .await;
        assert!(faq.is_some());
    }
}
