use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

/// One async mutex per instance. Held from load to commit so that
/// read-check-write sequences on the same instance never interleave.
#[derive(Default)]
pub(crate) struct InstanceLocks {
    locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl InstanceLocks {
    pub(crate) async fn acquire(&self, instance_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(instance_id)
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Drop the entry of a finished instance unless someone holds or awaits it.
    pub(crate) fn forget(&self, instance_id: Uuid) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&instance_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&instance_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
