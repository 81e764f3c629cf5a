use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use tokio::{sync::Mutex, task::JoinHandle};

/// How long an idle relay conversation lives before the advisory close fires.
pub const AUTO_CLOSE_AFTER: Duration = Duration::from_secs(23 * 60 * 60);

/// Process-wide delayed-close schedule keyed by conversation id. Entries are
/// not persisted; losing them on restart is acceptable because the remote API
/// owns conversation state and the timer is only a cleanup nudge.
#[derive(Default)]
pub struct AutoCloseScheduler {
    timers: Mutex<HashMap<i64, JoinHandle<()>>>,
}

impl AutoCloseScheduler {
    /// Schedules `action` to run after `delay` unless cancelled first.
    /// Re-scheduling the same key replaces the pending timer.
    pub async fn schedule<F>(self: &Arc<Self>, key: i64, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.timers.lock().await.remove(&key);
            action.await;
        });
        if let Some(previous) = self.timers.lock().await.insert(key, handle) {
            previous.abort();
        }
    }

    /// Cancelling a missing or already-fired timer is a no-op.
    pub async fn cancel(&self, key: i64) {
        if let Some(handle) = self.timers.lock().await.remove(&key) {
            handle.abort();
        }
    }

    pub async fn is_scheduled(&self, key: i64) -> bool {
        self.timers.lock().await.contains_key(&key)
    }
}
