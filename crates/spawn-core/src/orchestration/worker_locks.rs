use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::models::WorkerId;

/// Per-worker async mutexes. Operations on one worker run one at a time;
/// different workers never contend.
#[derive(Clone, Default)]
pub struct WorkerLocks {
    inner: Arc<Mutex<HashMap<WorkerId, Arc<Mutex<()>>>>>,
}

impl WorkerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, worker: &WorkerId) -> OwnedMutexGuard<()> {
        let worker_lock = {
            let mut locks = self.inner.lock().await;
            Arc::clone(locks.entry(worker.clone()).or_default())
        };
        worker_lock.lock_owned().await
    }

    /// Drops the entry for a deleted worker. Holders of an existing guard
    /// are unaffected.
    pub async fn forget(&self, worker: &WorkerId) {
        self.inner.lock().await.remove(worker);
    }

    pub async fn tracked(&self) -> usize {
        self.inner.lock().await.len()
    }
}
