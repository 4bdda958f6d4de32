//! Pool of named sandboxes handed out one submission at a time
//!
//! Every sandbox has its own working volume, and a lease grants exclusive use
//! of one sandbox until it is dropped. Concurrent submissions therefore never
//! share a working directory; they wait for a free slot instead.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{InstanceHandle, SandboxManager};
use crate::types::SandboxError;

pub struct SandboxPool {
    manager: Arc<SandboxManager>,
    names: Vec<String>,
    free: Arc<Mutex<Vec<usize>>>,
    permits: Arc<Semaphore>,
}

/// Exclusive use of one pool slot. The slot is returned on drop.
pub struct SandboxLease {
    name: String,
    index: usize,
    free: Arc<Mutex<Vec<usize>>>,
    _permit: OwnedSemaphorePermit,
}

impl SandboxLease {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        // Runs before the permit is released, so a woken waiter always finds
        // this index on the free list.
        self.free.lock().push(self.index);
        tracing::trace!(instance = %self.name, "Lease returned");
    }
}

impl SandboxPool {
    pub fn new(manager: Arc<SandboxManager>) -> Self {
        let config = manager.config();
        let size = config.pool_size.max(1);
        let names = (0..size)
            .map(|i| format!("{}-{}", config.name_prefix, i))
            .collect();
        // Reversed so slot 0 is handed out first
        let free = (0..size).rev().collect();

        Self {
            manager,
            names,
            free: Arc::new(Mutex::new(free)),
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    pub fn manager(&self) -> &Arc<SandboxManager> {
        &self.manager
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a free slot
    pub async fn checkout(&self) -> Result<SandboxLease, SandboxError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SandboxError::PoolClosed)?;

        let index = self.free.lock().pop().ok_or(SandboxError::PoolClosed)?;
        let name = self.names[index].clone();
        tracing::trace!(instance = %name, "Lease acquired");

        Ok(SandboxLease {
            name,
            index,
            free: self.free.clone(),
            _permit: permit,
        })
    }

    /// Provision every sandbox in the pool
    pub async fn warm(&self) -> Result<Vec<InstanceHandle>, SandboxError> {
        let mut handles = Vec::with_capacity(self.names.len());
        // Earlier leases stay held so each iteration gets a new slot
        let mut leases = Vec::with_capacity(self.names.len());
        for _ in 0..self.names.len() {
            let lease = self.checkout().await?;
            handles.push(self.manager.ensure_running(lease.name()).await?);
            leases.push(lease);
        }
        Ok(handles)
    }

    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, SandboxConfig};
    use crate::engine::MockEngine;
    use std::time::Duration;

    fn pool(engine: Arc<MockEngine>, pool_size: usize) -> SandboxPool {
        let config = Config::default();
        let sandbox = SandboxConfig {
            pool_size,
            ..config.sandbox
        };
        SandboxPool::new(Arc::new(SandboxManager::new(engine, &config.engine, sandbox)))
    }

    #[tokio::test]
    async fn test_leases_are_exclusive() {
        let pool = pool(Arc::new(MockEngine::new()), 2);

        let a = pool.checkout().await.unwrap();
        let b = pool.checkout().await.unwrap();
        assert_ne!(a.name(), b.name());
        assert_eq!(pool.available(), 0);

        // A third checkout waits until a lease is dropped
        let waiting = tokio::time::timeout(Duration::from_millis(50), pool.checkout()).await;
        assert!(waiting.is_err());

        let released = a.name().to_string();
        drop(a);
        let c = pool.checkout().await.unwrap();
        assert_eq!(c.name(), released);
    }

    #[tokio::test]
    async fn test_single_slot_serializes_submissions() {
        let pool = Arc::new(pool(Arc::new(MockEngine::new()), 1));
        let lease = pool.checkout().await.unwrap();
        assert_eq!(lease.name(), "codebox-sandbox-0");

        let contender = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.checkout().await.map(|l| l.name().to_string()) })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!contender.is_finished());

        drop(lease);
        let name = contender.await.unwrap().unwrap();
        assert_eq!(name, "codebox-sandbox-0");
    }

    #[tokio::test]
    async fn test_warm_provisions_every_slot() {
        let engine = Arc::new(MockEngine::new());
        let pool = pool(engine.clone(), 3);

        let handles = pool.warm().await.unwrap();
        assert_eq!(handles.len(), 3);
        assert_eq!(pool.available(), 3);
        assert_eq!(engine.calls("create_instance"), 3);
        for name in pool.names() {
            assert!(engine.instance(name).unwrap().running);
        }
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_checkout() {
        let pool = pool(Arc::new(MockEngine::new()), 1);
        pool.close();
        assert!(matches!(pool.checkout().await, Err(SandboxError::PoolClosed)));
    }
}
