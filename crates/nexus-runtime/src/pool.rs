//! Instance pool: amortizes sandbox creation and caps concurrency.
//!
//! Waiters queue FIFO on a fair semaphore whose permits bound the total
//! outstanding sandboxes; instance selection is LIFO so the most recently
//! released (cache-warm) instance is reused first. Suspended instances move
//! into a separate keyed registry and keep holding their permit, so
//! `active + idle + suspended` never exceeds `max_instances`.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{
    config::RuntimeConfig,
    error::Error,
    sandbox::{InstanceState, SandboxInstance, SandboxSettings},
};

#[derive(Debug)]
pub(crate) enum AcquireError {
    Shutdown,
    Init(Error),
}

/// A checked-out instance; holds the concurrency permit for its lifetime.
pub(crate) struct Lease {
    pub instance: SandboxInstance,
    permit: OwnedSemaphorePermit,
}

struct SuspendedEntry {
    instance: SandboxInstance,
    permit: OwnedSemaphorePermit,
}

pub(crate) struct InstancePool {
    settings: SandboxSettings,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<SandboxInstance>>,
    suspended: DashMap<String, SuspendedEntry>,
    suspension_timeout: Duration,
    active: AtomicUsize,
    shutdown: AtomicBool,
}

impl InstancePool {
    pub(crate) fn new(config: &RuntimeConfig) -> Self {
        Self {
            settings: SandboxSettings::from(config),
            permits: Arc::new(Semaphore::new(config.max_instances)),
            idle: Mutex::new(Vec::new()),
            suspended: DashMap::new(),
            suspension_timeout: config.suspension_timeout,
            active: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Check out an idle instance, creating one while under the cap. Waits
    /// FIFO when every permit is held.
    pub(crate) async fn acquire(&self) -> Result<Lease, AcquireError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| AcquireError::Shutdown)?;
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(AcquireError::Shutdown);
        }
        let popped = self.idle.lock().pop();
        let instance = match popped {
            Some(instance) => instance,
            None => SandboxInstance::new(&self.settings)
                .await
                .map_err(AcquireError::Init)?,
        };
        self.active.fetch_add(1, Ordering::Relaxed);
        self.update_gauges();
        Ok(Lease { instance, permit })
    }

    /// Return an instance after a successful cycle. Reset failures and
    /// terminated instances are dropped instead of pooled.
    pub(crate) async fn release(&self, lease: Lease) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        let Lease {
            mut instance,
            permit,
        } = lease;
        if !self.shutdown.load(Ordering::Relaxed)
            && instance.state() != InstanceState::Terminated
        {
            match instance.reset().await {
                Ok(()) => self.idle.lock().push(instance),
                Err(e) => {
                    tracing::debug!(instance = instance.id(), "dropping instance, reset failed: {e}");
                }
            }
        }
        drop(permit);
        self.update_gauges();
    }

    /// Drop an instance that must not serve another execution.
    pub(crate) fn discard(&self, lease: Lease) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        drop(lease);
        self.update_gauges();
    }

    /// Move an executing instance into the suspended registry under its
    /// suspension id. A reaper drops it if no resume arrives in time.
    pub(crate) fn park_suspended(self: &Arc<Self>, lease: Lease, suspension_id: &str) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        let Lease { instance, permit } = lease;
        self.suspended
            .insert(suspension_id.to_owned(), SuspendedEntry { instance, permit });
        self.update_gauges();

        let pool = Arc::clone(self);
        let id = suspension_id.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(pool.suspension_timeout).await;
            if pool.suspended.remove(&id).is_some() {
                tracing::warn!(suspension_id = %id, "suspension timed out, instance dropped");
                pool.update_gauges();
            }
        });
    }

    /// Remove and return a suspended instance; `None` when the id is unknown
    /// or already expired.
    pub(crate) fn take_suspended(&self, suspension_id: &str) -> Option<Lease> {
        let (_, entry) = self.suspended.remove(suspension_id)?;
        self.active.fetch_add(1, Ordering::Relaxed);
        self.update_gauges();
        Some(Lease {
            instance: entry.instance,
            permit: entry.permit,
        })
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub(crate) fn suspended_count(&self) -> usize {
        self.suspended.len()
    }

    /// Wake all waiters with a shutdown error and terminate every pooled and
    /// suspended instance. Idempotent.
    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.permits.close();
        self.idle.lock().clear();
        self.suspended.clear();
        self.update_gauges();
    }

    fn update_gauges(&self) {
        metrics::gauge!("nexus_pool_active").set(self.active_count() as f64);
        metrics::gauge!("nexus_pool_idle").set(self.idle_count() as f64);
        metrics::gauge!("nexus_pool_suspended").set(self.suspended_count() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max_instances: usize) -> Arc<InstancePool> {
        Arc::new(InstancePool::new(
            &RuntimeConfig::default().max_instances(max_instances),
        ))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn acquire_reuses_lifo() {
        let pool = pool(2);
        let a = pool.acquire().await.expect("acquire");
        let a_id = a.instance.id();
        pool.release(a).await;
        assert_eq!(pool.idle_count(), 1);

        let again = pool.acquire().await.expect("acquire");
        assert_eq!(again.instance.id(), a_id);
        pool.discard(again);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn waiters_block_until_release() {
        let pool = pool(1);
        let held = pool.acquire().await.expect("acquire");

        let contender = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let lease = pool.acquire().await.expect("acquire");
                pool.discard(lease);
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        pool.release(held).await;
        contender.await.expect("contender");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_wakes_waiters() {
        let pool = pool(1);
        let held = pool.acquire().await.expect("acquire");

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await.is_err() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.shutdown();
        assert!(waiter.await.expect("join"));
        pool.discard(held);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_suspension_is_none() {
        let pool = pool(1);
        assert!(pool.take_suspended("nope").is_none());
    }
}
