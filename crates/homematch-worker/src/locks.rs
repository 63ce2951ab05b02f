use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

/// In-process exclusion per `(user_id, profile_id)`.
///
/// Holding the permit covers diff, write and notify for one profile, so a
/// targeted run and the cron sweep never interleave on the same profile.
#[derive(Debug, Clone, Default)]
pub struct ProfileLocks {
    inner: Arc<Mutex<HashMap<(String, String), Arc<Semaphore>>>>,
}

impl ProfileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn semaphore(&self, user_id: &str, profile_id: &str) -> Arc<Semaphore> {
        let mut map = self.inner.lock().await;
        // Only the map holds an idle entry; any permit or waiter holds another clone.
        map.retain(|_, semaphore| Arc::strong_count(semaphore) > 1);
        map.entry((user_id.to_string(), profile_id.to_string()))
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    pub async fn acquire(&self, user_id: &str, profile_id: &str) -> OwnedSemaphorePermit {
        self.semaphore(user_id, profile_id)
            .await
            .acquire_owned()
            .await
            .expect("semaphore not closed")
    }

    /// Number of profiles with a lock entry.
    pub async fn tracked(&self) -> usize {
        self.inner.lock().await.len()
    }
}
