use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

/// Keyed async mutexes. Operations on the same ride (or driver) run one at a
/// time; operations on different keys never wait on each other.
#[derive(Default)]
pub struct EntityLocks {
    locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`. The guard is `'static` so it can be
    /// held across awaits and moved into spawned tasks.
    pub async fn lock(&self, id: Uuid) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(id).or_default().clone()
        };
        mutex.lock_owned().await
    }

    /// Drop entries nobody holds or waits on.
    pub fn prune(&self) -> usize {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let before = locks.len();
        locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before - locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
