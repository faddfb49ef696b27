//! Randomized delayed-flush scheduler
//!
//! Decides when and how much of the queue to persist. Both decisions are
//! randomized: fire times are drawn from a window (a long one after an idle
//! queue, a short one while draining backlog) and records are selected
//! uniformly at random, so neither the cadence nor the batch composition can
//! be correlated with any submission event. Flushing below the per-survey
//! minimum floor is never allowed; small batches would permit
//! re-identification by elimination.
//!
//! Only the leader arms this scheduler. The timer task re-schedules itself
//! from its own completion, and the arm-generation plus in-flight flag in the
//! queue guarantee a single in-flight cycle.

use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::common::{DelayConfig, Error, Metrics, Result};
use crate::gateway::{PersistenceGateway, TextAnonymizer};
use crate::node::election::LeaderElector;
use crate::node::queue::{Answer, PendingResponse, SubmissionQueue};

/// Which delay window to draw the next fire time from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmWindow {
    /// First arm after an idle queue: long, unpredictable delay
    Cold,
    /// Re-arm after a productive flush: short delay to drain backlog
    Hot,
}

pub struct DelayScheduler {
    queue: Arc<SubmissionQueue>,
    gateway: Arc<dyn PersistenceGateway>,
    anonymizer: Arc<dyn TextAnonymizer>,
    elector: Arc<LeaderElector>,
    delay: DelayConfig,
    metrics: Arc<Metrics>,
}

impl DelayScheduler {
    pub fn new(
        queue: Arc<SubmissionQueue>,
        gateway: Arc<dyn PersistenceGateway>,
        anonymizer: Arc<dyn TextAnonymizer>,
        elector: Arc<LeaderElector>,
        delay: DelayConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            queue,
            gateway,
            anonymizer,
            elector,
            delay,
            metrics,
        }
    }

    /// Arm the flush timer if it is idle. Followers never arm.
    pub fn arm(self: &Arc<Self>, window: ArmWindow) {
        if !self.elector.is_leader() {
            return;
        }
        let delay = self.pick_delay(window);
        let fire_at = Utc::now() + chrono::Duration::seconds(delay.as_secs() as i64);
        let Some(generation) = self.queue.try_arm(fire_at) else {
            return;
        };
        tracing::debug!(delay_secs = delay.as_secs(), "flush timer armed");

        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.fire(generation).await;
        });
    }

    /// Stop any armed timer; the sleeping task wakes to a stale generation
    /// and exits without firing.
    pub fn stop(&self) {
        self.queue.disarm();
    }

    async fn fire(self: Arc<Self>, generation: u64) {
        if !self.queue.begin_cycle(generation) {
            return;
        }
        if !self.elector.is_leader() {
            // demoted while the timer slept
            self.queue.finish_cycle(0);
            return;
        }
        self.execute_cycle().await;
    }

    /// One firing: select-and-persist, record the outcome, then either re-arm
    /// on the short window or go idle with the percentage reset.
    pub(crate) async fn execute_cycle(self: &Arc<Self>) -> usize {
        let flushed = self.run_cycle().await;
        self.queue.finish_cycle(flushed);
        self.metrics.queue_depth.set(self.queue.len() as u64);

        if flushed > 0 {
            self.queue.advance_percentage(&self.delay);
            self.arm(ArmWindow::Hot);
        } else {
            self.queue.reset_percentage();
        }
        flushed
    }

    /// The selection-and-persist pass over every survey with pending records.
    async fn run_cycle(&self) -> usize {
        self.metrics.flush_cycles.inc();
        let percentage = self.queue.current_percentage();
        let counts = self.queue.survey_counts();

        let mut flushed = 0usize;
        for survey_id in counts.into_keys() {
            let question_count = match self.gateway.question_count(survey_id).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(survey_id = %survey_id, error = %e,
                        "question count unavailable, survey skipped this cycle");
                    continue;
                }
            };
            let floor = question_count * self.delay.minimum_survey_submissions;
            let selected = self.queue.take_random_throttled(survey_id, floor, percentage);
            if selected.is_empty() {
                continue;
            }
            if let Ok(count) = self.persist_batch(survey_id, selected).await {
                flushed += count;
            }
        }
        flushed
    }

    /// Administrative flush of one survey: every pending record, random
    /// order, no throttle and no minimum floor. Leader-only.
    pub async fn flush_survey(&self, survey_id: Uuid) -> Result<usize> {
        if !self.elector.is_leader() {
            return Err(Error::NotLeader("unknown".into()));
        }
        let selected = self.queue.take_all_for_survey(survey_id);
        if selected.is_empty() {
            return Ok(0);
        }
        let count = self.persist_batch(survey_id, selected).await?;
        self.queue.record_flush(count);
        self.metrics.queue_depth.set(self.queue.len() as u64);
        Ok(count)
    }

    /// Anonymize free-text answers and hand the batch to durable storage.
    /// Anonymization failure is non-fatal; persistence failure puts the batch
    /// back into the queue and propagates. Log lines carry counts and survey
    /// ids only, never answer content.
    async fn persist_batch(
        &self,
        survey_id: Uuid,
        mut records: Vec<PendingResponse>,
    ) -> Result<usize> {
        for record in records.iter_mut() {
            if let Answer::Text(text) = &record.answer {
                match self.anonymizer.anonymize(text).await {
                    Ok(clean) => record.answer = Answer::Text(clean),
                    Err(e) => {
                        tracing::warn!(survey_id = %survey_id, error = %e,
                            "anonymization unavailable, persisting original text");
                    }
                }
            }
        }

        let count = records.len();
        match self
            .gateway
            .persist_responses(survey_id, records.clone())
            .await
        {
            Ok(()) => {
                self.metrics.flushed_total.add(count as u64);
                tracing::debug!(survey_id = %survey_id, count, "responses persisted");
                Ok(count)
            }
            Err(e) => {
                tracing::warn!(survey_id = %survey_id, count, error = %e,
                    "persistence failed, batch requeued");
                self.queue.enqueue(records);
                Err(e)
            }
        }
    }

    fn pick_delay(&self, window: ArmWindow) -> Duration {
        let (min, max) = match window {
            ArmWindow::Cold => (self.delay.cold_window_min_secs, self.delay.cold_window_max_secs),
            ArmWindow::Hot => (self.delay.hot_window_min_secs, self.delay.hot_window_max_secs),
        };
        Duration::from_secs(rand::thread_rng().gen_range(min..=max))
    }
}
