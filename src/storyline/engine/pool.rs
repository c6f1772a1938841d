//! Bounded worker pool for fragments

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use super::fragment::{FragmentReport, FragmentTask};
use crate::sdk::error::StoryError;

/// Caps how many fragments traverse at once.
///
/// A fragment holds a [`WorkerSlot`] while it runs and gives it back while
/// it waits on child fragments, so nested waits never starve the pool.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots not held by any fragment right now
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn acquire(&self) -> Result<WorkerSlot, StoryError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| StoryError::interrupted("worker pool closed"))?;
        Ok(WorkerSlot {
            permit: Some(permit),
            permits: Arc::clone(&self.permits),
        })
    }

    pub fn spawn(&self, fragment: FragmentTask) -> JoinHandle<FragmentReport> {
        log::trace!("Spawning fragment {}", fragment.id);
        tokio::spawn(fragment.run())
    }
}

/// A held pool slot
#[derive(Debug)]
pub struct WorkerSlot {
    permit: Option<OwnedSemaphorePermit>,
    permits: Arc<Semaphore>,
}

impl WorkerSlot {
    /// Give the slot back while `fut` runs, then take one again
    pub async fn release_while<F: Future>(&mut self, fut: F) -> Result<F::Output, StoryError> {
        self.permit.take();
        let output = fut.await;
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| StoryError::interrupted("worker pool closed"))?;
        self.permit = Some(permit);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_slot_accounting() {
        let pool = WorkerPool::new(2);
        let mut slot = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 1);

        let seen = slot.release_while(async { pool.available() }).await.unwrap();
        assert_eq!(seen, 2);
        assert_eq!(pool.available(), 1);

        drop(slot);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_zero_size_is_clamped() {
        assert_eq!(WorkerPool::new(0).size(), 1);
    }
}
