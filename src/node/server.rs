//! Node wiring and serving
//!
//! A `Node` is an explicitly constructed component instance: election,
//! persistence, transfer, anonymization, and admin authorization are injected
//! as capabilities at bind time, never looked up from globals. Binding
//! happens before construction so the instance identity reflects the port
//! actually owned.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Notify};

use crate::common::{Config, Error, Metrics, Result};
use crate::gateway::{AdminAuth, PersistenceGateway, SurveyLifecycle, TextAnonymizer};
use crate::node::coordination::CoordinationStore;
use crate::node::election::LeaderElector;
use crate::node::http::{create_router, AppState};
use crate::node::queue::{derive_discrepancies, PendingResponse, QueueStatus, SubmissionQueue};
use crate::node::scheduler::{ArmWindow, DelayScheduler};
use crate::node::transfer::{Delivery, TransferClient};
use crate::node::transition;

/// External collaborators injected into a node
#[derive(Clone)]
pub struct Collaborators {
    pub persistence: Arc<dyn PersistenceGateway>,
    pub anonymizer: Arc<dyn TextAnonymizer>,
    pub lifecycle: Arc<dyn SurveyLifecycle>,
    pub admin_auth: Arc<dyn AdminAuth>,
}

struct NodeInner {
    cfg: Config,
    local_addr: SocketAddr,
    instance_id: String,
    listener: std::sync::Mutex<Option<TcpListener>>,
    queue: Arc<SubmissionQueue>,
    elector: Arc<LeaderElector>,
    scheduler: Arc<DelayScheduler>,
    transfer: Arc<TransferClient>,
    store: Arc<dyn CoordinationStore>,
    lifecycle: Arc<dyn SurveyLifecycle>,
    admin_auth: Arc<dyn AdminAuth>,
    metrics: Arc<Metrics>,
    status_tx: broadcast::Sender<QueueStatus>,
    shutdown: Notify,
}

/// One running instance of the delayed-submission subsystem
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Bind the listener and wire all components. The configuration must
    /// already have passed validation; the instance identity is derived from
    /// the advertised host and the actually bound port.
    pub async fn bind(
        cfg: Config,
        store: Arc<dyn CoordinationStore>,
        collaborators: Collaborators,
    ) -> Result<Node> {
        cfg.validate()?;

        let listener = TcpListener::bind(cfg.instance.bind_addr()?).await?;
        let local_addr = listener.local_addr()?;
        let instance_id = format!("{}:{}", cfg.instance.host, local_addr.port());

        let queue = Arc::new(SubmissionQueue::new(&cfg.delay));
        let metrics = Arc::new(Metrics::default());
        let elector = Arc::new(LeaderElector::new(
            instance_id.clone(),
            store.clone(),
            cfg.election.clone(),
            cfg.instance.standalone,
        ));
        let scheduler = Arc::new(DelayScheduler::new(
            queue.clone(),
            collaborators.persistence.clone(),
            collaborators.anonymizer.clone(),
            elector.clone(),
            cfg.delay.clone(),
            metrics.clone(),
        ));
        let transfer = Arc::new(TransferClient::new(
            instance_id.clone(),
            cfg.instance.secret.clone(),
            store.clone(),
            cfg.delay.transfer_timeout(),
        )?);
        let (status_tx, _) = broadcast::channel(64);

        Ok(Node {
            inner: Arc::new(NodeInner {
                cfg,
                local_addr,
                instance_id,
                listener: std::sync::Mutex::new(Some(listener)),
                queue,
                elector,
                scheduler,
                transfer,
                store,
                lifecycle: collaborators.lifecycle,
                admin_auth: collaborators.admin_auth,
                metrics,
                status_tx,
                shutdown: Notify::new(),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn is_leader(&self) -> bool {
        self.inner.elector.is_leader()
    }

    /// Content-free snapshot for operators
    pub fn status(&self) -> QueueStatus {
        self.inner.queue.status(&self.inner.elector.state())
    }

    /// Status-changed notification stream
    pub fn subscribe_status(&self) -> broadcast::Receiver<QueueStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Accept a submitted batch. On the leader the records are derived and
    /// held locally until a flush cycle selects them; on a follower the batch
    /// skips the local queue and is forwarded to the leader, with exactly-once
    /// local retention when the forward fails. Leadership is evaluated per
    /// call because it can change between calls.
    pub async fn queue_responses(&self, mut batch: Vec<PendingResponse>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        derive_discrepancies(&mut batch);
        self.inner.metrics.queued_total.add(batch.len() as u64);

        if self.inner.elector.is_leader() {
            self.inner.queue.enqueue(batch);
            self.inner.scheduler.arm(ArmWindow::Cold);
        } else {
            self.forward_to_leader(batch).await;
        }
        self.inner.metrics.queue_depth.set(self.inner.queue.len() as u64);
        Ok(())
    }

    /// Administrative immediate flush of one survey; leader-only
    pub async fn flush_survey(&self, survey_id: uuid::Uuid) -> Result<usize> {
        let count = self.inner.scheduler.flush_survey(survey_id).await?;
        let _ = self
            .inner
            .status_tx
            .send(self.inner.queue.status(&self.inner.elector.state()));
        Ok(count)
    }

    /// Close a survey: directly through the lifecycle collaborator on the
    /// leader, forwarded over the transfer channel from a follower
    pub async fn close_survey(&self, survey_id: uuid::Uuid) -> Result<()> {
        if self.inner.elector.is_leader() {
            self.inner.lifecycle.close_survey(survey_id).await
        } else {
            self.inner.transfer.close_survey_on_leader(survey_id).await
        }
    }

    /// Serve until `shutdown()`. Spawns the election heartbeat and the
    /// transition handler, then runs the HTTP listener.
    pub async fn serve(&self) -> Result<()> {
        let listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| Error::Internal("node is already serving".into()))?;

        self.spawn_address_registration();
        let elector_task = tokio::spawn(self.inner.elector.clone().run());
        let transition_task = transition::spawn(
            self.inner.elector.subscribe(),
            self.inner.queue.clone(),
            self.inner.scheduler.clone(),
            self.inner.transfer.clone(),
            self.inner.metrics.clone(),
            self.inner.status_tx.clone(),
        );

        let state = AppState {
            queue: self.inner.queue.clone(),
            elector: self.inner.elector.clone(),
            scheduler: self.inner.scheduler.clone(),
            lifecycle: self.inner.lifecycle.clone(),
            admin_auth: self.inner.admin_auth.clone(),
            metrics: self.inner.metrics.clone(),
            status_tx: self.inner.status_tx.clone(),
            instance_secret: self.inner.cfg.instance.secret.clone(),
        };
        let router = create_router(state);

        tracing::info!(
            addr = %self.inner.local_addr,
            instance_id = %self.inner.instance_id,
            "veilq node listening"
        );

        let inner = self.inner.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { inner.shutdown.notified().await })
            .await?;

        // Shutdown: stop the timer and the transition handler first so no
        // cycle or drain races what follows.
        transition_task.abort();
        self.inner.scheduler.stop();

        let was_leader = self.inner.elector.is_leader();
        self.inner.elector.shutdown();
        let _ = elector_task.await;

        let pending = self.inner.queue.len();
        if pending > 0 {
            if was_leader {
                // Never auto-flush a stopping leader: shutdown-time flushing
                // would correlate uptime with what got persisted. Operators
                // drain with the administrative flush before planned stops.
                tracing::info!(
                    pending,
                    "leader stopping with undelivered responses; they are dropped"
                );
            } else {
                self.forward_to_leader(self.inner.queue.drain_all()).await;
            }
        }
        tracing::info!(instance_id = %self.inner.instance_id, "veilq node stopped");
        Ok(())
    }

    /// Request a graceful stop of `serve`
    pub fn shutdown(&self) {
        self.inner.shutdown.notify_waiters();
    }

    /// Forward a batch to the leader, retaining it locally exactly once when
    /// delivery is impossible. Failures are logged with counts only.
    async fn forward_to_leader(&self, batch: Vec<PendingResponse>) {
        // fold in anything retained from earlier failed attempts so a retry
        // never duplicates records
        let mut outgoing = self.inner.queue.drain_all();
        outgoing.extend(batch);
        if outgoing.is_empty() {
            return;
        }
        let count = outgoing.len();

        match self.inner.transfer.transfer_to_leader(outgoing.clone()).await {
            Ok(Delivery::Sent(_)) => {
                self.inner.metrics.transferred_total.add(count as u64);
                tracing::debug!(count, "responses forwarded to leader");
            }
            Ok(Delivery::SelfLeader) => {
                // leadership flipped mid-call; keep the batch and schedule it
                self.inner.queue.enqueue(outgoing);
                self.inner.scheduler.arm(ArmWindow::Cold);
            }
            Err(e) => {
                self.inner.metrics.transfer_failures.inc();
                tracing::warn!(count, error = %e, "transfer to leader failed, batch retained");
                self.inner.queue.enqueue(outgoing);
            }
        }
    }

    /// Publish this instance's transfer address; retried in the background
    /// until the coordination store accepts it.
    fn spawn_address_registration(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            // the advertised host:port, not the raw bind address
            let addr = inner.instance_id.clone();
            let interval = inner.cfg.election.heartbeat_interval();
            loop {
                match inner.store.register_address(&inner.instance_id, &addr).await {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "address registration failed, retrying");
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        });
    }
}
