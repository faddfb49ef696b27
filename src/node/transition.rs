//! Leadership transition handling
//!
//! Subscribes to the elector's leadership channel. A promoted instance arms
//! the flush scheduler unconditionally so records enqueued moments later are
//! picked up; a demoted instance stops its scheduler and drains its queue in
//! one shot to the new leader. Every transition emits a status snapshot on
//! the observability stream.

use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::common::Metrics;
use crate::node::election::LeadershipState;
use crate::node::queue::{QueueStatus, SubmissionQueue};
use crate::node::scheduler::{ArmWindow, DelayScheduler};
use crate::node::transfer::{Delivery, TransferClient};

pub fn spawn(
    mut leadership_rx: watch::Receiver<LeadershipState>,
    queue: Arc<SubmissionQueue>,
    scheduler: Arc<DelayScheduler>,
    transfer: Arc<TransferClient>,
    metrics: Arc<Metrics>,
    status_tx: broadcast::Sender<QueueStatus>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut was_leader = leadership_rx.borrow().is_leader;
        loop {
            if leadership_rx.changed().await.is_err() {
                break;
            }
            let state = leadership_rx.borrow_and_update().clone();
            if state.is_leader == was_leader {
                continue;
            }
            was_leader = state.is_leader;
            metrics.leadership_changes.inc();

            if state.is_leader {
                handle_promotion(&queue, &scheduler, &state);
            } else {
                handle_demotion(&queue, &scheduler, &transfer, &metrics, &state).await;
            }

            let _ = status_tx.send(queue.status(&state));
        }
    })
}

fn handle_promotion(
    queue: &Arc<SubmissionQueue>,
    scheduler: &Arc<DelayScheduler>,
    state: &LeadershipState,
) {
    tracing::info!(instance_id = %state.instance_id, "promoted to leader");
    // arm even when the queue is empty; an inherited or freshly enqueued
    // backlog must be picked up within one cycle
    let window = if queue.is_empty() {
        ArmWindow::Cold
    } else {
        ArmWindow::Hot
    };
    scheduler.arm(window);
}

async fn handle_demotion(
    queue: &Arc<SubmissionQueue>,
    scheduler: &Arc<DelayScheduler>,
    transfer: &Arc<TransferClient>,
    metrics: &Arc<Metrics>,
    state: &LeadershipState,
) {
    tracing::info!(instance_id = %state.instance_id, "demoted to follower");
    scheduler.stop();

    let drained = queue.drain_all();
    if drained.is_empty() {
        return;
    }
    let count = drained.len();
    match transfer.transfer_to_leader(drained.clone()).await {
        Ok(Delivery::Sent(_)) => {
            metrics.transferred_total.add(count as u64);
            tracing::info!(count, "queue drained to new leader");
        }
        Ok(Delivery::SelfLeader) => {
            // re-promoted before the drain went out; keep the records
            queue.enqueue(drained);
        }
        Err(e) => {
            metrics.transfer_failures.inc();
            tracing::warn!(count, error = %e, "drain to new leader failed, responses retained");
            queue.enqueue(drained);
        }
    }
    metrics.queue_depth.set(queue.len() as u64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{DelayConfig, ElectionConfig};
    use crate::gateway::{MemoryGateway, PassthroughAnonymizer, PersistenceGateway, TextAnonymizer};
    use crate::node::coordination::{CoordinationStore, MemoryCoordinationStore};
    use crate::node::election::LeaderElector;
    use crate::node::queue::{Answer, PendingResponse};
    use std::time::Duration;
    use uuid::Uuid;

    struct Harness {
        elector: Arc<LeaderElector>,
        queue: Arc<SubmissionQueue>,
        status_rx: broadcast::Receiver<QueueStatus>,
        _handle: JoinHandle<()>,
    }

    fn harness(store: Arc<MemoryCoordinationStore>) -> Harness {
        let delay = DelayConfig::default();
        let queue = Arc::new(SubmissionQueue::new(&delay));
        let elector = Arc::new(LeaderElector::new(
            "local:1".into(),
            store.clone() as Arc<dyn CoordinationStore>,
            ElectionConfig::default(),
            false,
        ));
        let gateway = Arc::new(MemoryGateway::new());
        let metrics = Arc::new(Metrics::default());
        let scheduler = Arc::new(DelayScheduler::new(
            queue.clone(),
            gateway as Arc<dyn PersistenceGateway>,
            Arc::new(PassthroughAnonymizer) as Arc<dyn TextAnonymizer>,
            elector.clone(),
            delay.clone(),
            metrics.clone(),
        ));
        let transfer = Arc::new(
            TransferClient::new(
                "local:1".into(),
                "fleet-secret".into(),
                store as Arc<dyn CoordinationStore>,
                Duration::from_millis(300),
            )
            .unwrap(),
        );
        let (status_tx, status_rx) = broadcast::channel(16);
        let handle = spawn(
            elector.subscribe(),
            queue.clone(),
            scheduler,
            transfer,
            metrics,
            status_tx,
        );
        Harness {
            elector,
            queue,
            status_rx,
            _handle: handle,
        }
    }

    async fn next_status(h: &mut Harness) -> QueueStatus {
        tokio::time::timeout(Duration::from_secs(2), h.status_rx.recv())
            .await
            .expect("transition status")
            .expect("channel open")
    }

    fn rating_batch(n: usize) -> Vec<PendingResponse> {
        let survey = Uuid::new_v4();
        (0..n)
            .map(|i| PendingResponse::new(survey, Uuid::new_v4(), Answer::Rating(i as i64)))
            .collect()
    }

    #[tokio::test]
    async fn test_promotion_arms_scheduler() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let mut h = harness(store);
        // let the transition task capture its initial (follower) baseline
        // before we flip leadership
        tokio::task::yield_now().await;
        h.queue.enqueue(rating_batch(4));

        h.elector.set_leadership(true);
        let status = next_status(&mut h).await;
        assert!(status.is_leader);
        assert!(h.queue.is_armed());
    }

    #[tokio::test]
    async fn test_promotion_with_empty_queue_still_arms() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let mut h = harness(store);
        // let the transition task capture its initial (follower) baseline
        // before we flip leadership
        tokio::task::yield_now().await;

        h.elector.set_leadership(true);
        let status = next_status(&mut h).await;
        assert!(status.is_leader);
        assert!(h.queue.is_armed());
    }

    #[tokio::test]
    async fn test_demotion_retains_queue_when_leader_unreachable() {
        let store = Arc::new(MemoryCoordinationStore::new());
        // a new leader exists in the directory but nothing listens there
        store
            .acquire_or_renew("other:2", Duration::from_secs(30))
            .await
            .unwrap();
        store
            .register_address("other:2", "127.0.0.1:1")
            .await
            .unwrap();

        let mut h = harness(store);
        // let the transition task capture its initial (follower) baseline
        // before we flip leadership
        tokio::task::yield_now().await;
        h.elector.set_leadership(true);
        next_status(&mut h).await;
        h.queue.enqueue(rating_batch(7));

        h.elector.set_leadership(false);
        let status = next_status(&mut h).await;
        assert!(!status.is_leader);
        // drain failed: all 7 retained, none duplicated, timer stopped
        assert_eq!(h.queue.len(), 7);
        assert!(!h.queue.is_armed());
    }

    #[tokio::test]
    async fn test_demotion_drains_to_reachable_leader() {
        let store = Arc::new(MemoryCoordinationStore::new());

        // a real leader endpoint: router + state of a standalone leader
        let leader_delay = DelayConfig::default();
        let leader_queue = Arc::new(SubmissionQueue::new(&leader_delay));
        let leader_store = Arc::new(MemoryCoordinationStore::new());
        let leader_elector = Arc::new(LeaderElector::new(
            "other:2".into(),
            leader_store.clone() as Arc<dyn CoordinationStore>,
            ElectionConfig::default(),
            true,
        ));
        let leader_gateway = Arc::new(MemoryGateway::new());
        let leader_metrics = Arc::new(Metrics::default());
        let leader_scheduler = Arc::new(DelayScheduler::new(
            leader_queue.clone(),
            leader_gateway.clone() as Arc<dyn PersistenceGateway>,
            Arc::new(PassthroughAnonymizer) as Arc<dyn TextAnonymizer>,
            leader_elector.clone(),
            leader_delay,
            leader_metrics.clone(),
        ));
        let (leader_status_tx, _) = broadcast::channel(16);
        let router = crate::node::http::create_router(crate::node::http::AppState {
            queue: leader_queue.clone(),
            elector: leader_elector,
            scheduler: leader_scheduler,
            lifecycle: leader_gateway as Arc<dyn crate::gateway::SurveyLifecycle>,
            admin_auth: Arc::new(crate::gateway::TokenAdminAuth::new("ops-token")),
            metrics: leader_metrics,
            status_tx: leader_status_tx,
            instance_secret: "fleet-secret".into(),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        store
            .acquire_or_renew("other:2", Duration::from_secs(30))
            .await
            .unwrap();
        store
            .register_address("other:2", &addr.to_string())
            .await
            .unwrap();

        let mut h = harness(store);
        // let the transition task capture its initial (follower) baseline
        // before we flip leadership
        tokio::task::yield_now().await;
        h.elector.set_leadership(true);
        next_status(&mut h).await;
        h.queue.enqueue(rating_batch(7));

        h.elector.set_leadership(false);
        let status = next_status(&mut h).await;
        assert!(!status.is_leader);
        assert!(h.queue.is_empty());
        assert_eq!(leader_queue.len(), 7);
    }

    #[tokio::test]
    async fn test_demotion_with_empty_queue_only_stops_scheduler() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let mut h = harness(store);
        // let the transition task capture its initial (follower) baseline
        // before we flip leadership
        tokio::task::yield_now().await;
        h.elector.set_leadership(true);
        next_status(&mut h).await;
        assert!(h.queue.is_armed());

        h.elector.set_leadership(false);
        let status = next_status(&mut h).await;
        assert!(!status.is_leader);
        assert!(!h.queue.is_armed());
        assert!(h.queue.is_empty());
    }
}
