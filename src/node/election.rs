//! Leader election over the shared coordination store
//!
//! Each instance runs one heartbeat loop that tries to acquire or renew the
//! fleet's single lease record. Whoever holds an unexpired lease is the
//! leader; everyone else follows. When the store is unreachable the instance
//! assumes it is NOT the leader and retries with backoff — under uncertainty
//! the privacy guarantee (no unled flushing) wins over flush availability.
//!
//! Leadership changes are published on a watch channel that notifies exactly
//! when the `is_leader` flag flips.

use std::sync::Arc;
use tokio::sync::{watch, Notify};

use crate::common::{ElectionConfig, Result};
use crate::node::coordination::CoordinationStore;

/// Leadership as seen by this instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadershipState {
    pub instance_id: String,
    pub is_leader: bool,
    /// True once election has stabilized at least once
    pub is_ready: bool,
}

pub struct LeaderElector {
    instance_id: String,
    store: Arc<dyn CoordinationStore>,
    cfg: ElectionConfig,
    standalone: bool,
    state_tx: watch::Sender<LeadershipState>,
    shutdown: Notify,
}

impl LeaderElector {
    /// Single-instance deployments (`standalone`) self-declare leader with
    /// `is_ready` true immediately and never touch the store.
    pub fn new(
        instance_id: String,
        store: Arc<dyn CoordinationStore>,
        cfg: ElectionConfig,
        standalone: bool,
    ) -> Self {
        let (state_tx, _) = watch::channel(LeadershipState {
            instance_id: instance_id.clone(),
            is_leader: standalone,
            is_ready: standalone,
        });
        Self {
            instance_id,
            store,
            cfg,
            standalone,
            state_tx,
            shutdown: Notify::new(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn is_leader(&self) -> bool {
        self.state_tx.borrow().is_leader
    }

    pub fn is_ready(&self) -> bool {
        self.state_tx.borrow().is_ready
    }

    pub fn state(&self) -> LeadershipState {
        self.state_tx.borrow().clone()
    }

    /// Subscribe to leadership changes; the receiver is notified exactly when
    /// `is_leader` flips.
    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.state_tx.subscribe()
    }

    /// One election round: contend for the lease and update local state.
    /// A store failure demotes to follower and propagates for backoff.
    pub(crate) async fn tick(&self) -> Result<()> {
        match self
            .store
            .acquire_or_renew(&self.instance_id, self.cfg.lease_ttl())
            .await
        {
            Ok(lease) => {
                self.update(lease.held_by(&self.instance_id), true);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "coordination store unreachable, assuming non-leader");
                let was_ready = self.is_ready();
                self.update(false, was_ready);
                Err(e)
            }
        }
    }

    /// Heartbeat loop; runs until `shutdown` and releases a held lease on the
    /// way out. Standalone instances return immediately.
    pub async fn run(self: Arc<Self>) {
        if self.standalone {
            tracing::info!(instance_id = %self.instance_id, "standalone instance, self-declared leader");
            return;
        }

        let mut backoff = std::time::Duration::from_secs(self.cfg.retry_backoff_secs);
        let backoff_max = std::time::Duration::from_secs(self.cfg.retry_backoff_max_secs);

        loop {
            let sleep_for = match self.tick().await {
                Ok(()) => {
                    backoff = std::time::Duration::from_secs(self.cfg.retry_backoff_secs);
                    self.cfg.heartbeat_interval()
                }
                Err(_) => {
                    let delay = backoff;
                    backoff = (backoff * 2).min(backoff_max);
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.shutdown.notified() => break,
            }
        }

        if self.is_leader() {
            if let Err(e) = self.store.release(&self.instance_id).await {
                tracing::warn!(error = %e, "failed to release lease on shutdown");
            }
            self.update(false, true);
        }
        tracing::info!(instance_id = %self.instance_id, "election heartbeat stopped");
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    fn update(&self, is_leader: bool, is_ready: bool) {
        let flipped = self.state_tx.send_if_modified(|state| {
            state.is_ready = is_ready;
            if state.is_leader != is_leader {
                state.is_leader = is_leader;
                true
            } else {
                false
            }
        });
        if flipped {
            tracing::info!(instance_id = %self.instance_id, is_leader, "leadership changed");
        }
    }

    #[cfg(test)]
    pub(crate) fn set_leadership(&self, is_leader: bool) {
        self.update(is_leader, true);
    }
}
