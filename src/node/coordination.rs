//! Shared coordination store: leader lease and instance directory
//!
//! The fleet agrees on a leader through a single lease record in a store all
//! instances can reach. The store also maps instance ids to reachable
//! addresses so followers can locate the current leader. Deployments back
//! this with their shared database; the in-memory implementation serves
//! single-process fleets and tests, including failure injection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::common::{timestamp_now_millis, Error, Result};

/// The leader lease record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub holder_id: String,
    pub acquired_at_ms: u64,
    pub expires_at_ms: u64,
}

impl LeaseRecord {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }

    pub fn held_by(&self, instance_id: &str) -> bool {
        self.holder_id == instance_id
    }
}

/// Lease arbitration and instance address directory
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Atomically acquire or renew the leader lease: the caller wins when no
    /// unexpired lease exists or when it already holds the lease. Returns the
    /// lease in effect after the attempt, whoever holds it.
    async fn acquire_or_renew(&self, instance_id: &str, ttl: Duration) -> Result<LeaseRecord>;

    /// Current lease, if any, without contending for it
    async fn current_lease(&self) -> Result<Option<LeaseRecord>>;

    /// Drop the lease if held by this instance (graceful handover)
    async fn release(&self, instance_id: &str) -> Result<()>;

    /// Publish the address this instance serves transfer calls on
    async fn register_address(&self, instance_id: &str, addr: &str) -> Result<()>;

    /// Resolve an instance id to its transfer address
    async fn lookup_address(&self, instance_id: &str) -> Result<Option<String>>;
}

#[derive(Default)]
struct StoreInner {
    lease: Option<LeaseRecord>,
    directory: HashMap<String, String>,
}

/// In-memory coordination store
#[derive(Default)]
pub struct MemoryCoordinationStore {
    inner: Mutex<StoreInner>,
    unavailable: AtomicBool,
}

impl MemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Failure injection: make every call fail until cleared
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::CoordinationUnavailable("injected outage".into()));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn acquire_or_renew(&self, instance_id: &str, ttl: Duration) -> Result<LeaseRecord> {
        self.check_available()?;
        let now = timestamp_now_millis();
        let mut inner = self.lock();

        let take_over = match &inner.lease {
            None => true,
            Some(lease) => lease.is_expired(now) || lease.held_by(instance_id),
        };

        if take_over {
            let lease = LeaseRecord {
                holder_id: instance_id.to_string(),
                acquired_at_ms: now,
                expires_at_ms: now + ttl.as_millis() as u64,
            };
            inner.lease = Some(lease.clone());
            Ok(lease)
        } else {
            Ok(inner.lease.clone().expect("lease present"))
        }
    }

    async fn current_lease(&self) -> Result<Option<LeaseRecord>> {
        self.check_available()?;
        Ok(self.lock().lease.clone())
    }

    async fn release(&self, instance_id: &str) -> Result<()> {
        self.check_available()?;
        let mut inner = self.lock();
        if inner
            .lease
            .as_ref()
            .is_some_and(|l| l.held_by(instance_id))
        {
            inner.lease = None;
        }
        Ok(())
    }

    async fn register_address(&self, instance_id: &str, addr: &str) -> Result<()> {
        self.check_available()?;
        self.lock()
            .directory
            .insert(instance_id.to_string(), addr.to_string());
        Ok(())
    }

    async fn lookup_address(&self, instance_id: &str) -> Result<Option<String>> {
        self.check_available()?;
        Ok(self.lock().directory.get(instance_id).cloned())
    }
}
