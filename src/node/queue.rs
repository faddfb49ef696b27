//! In-memory holding area for not-yet-persisted responses
//!
//! The queue and the flush schedule counters are one shared mutable resource
//! guarded by a single mutex. Everything that reads or mutates queue contents
//! or schedule state happens inside that region; I/O (persistence, transfer,
//! anonymization) never does. Callers copy records out, release the lock, and
//! then perform I/O.
//!
//! A `PendingResponse` carries no participant identifier. That absence is the
//! load-bearing property of the subsystem: nothing in this module can be
//! joined back to an identity, and nothing here may ever be logged with its
//! answer content.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::common::DelayConfig;
use crate::node::election::LeadershipState;

/// Answer payload of a single response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Answer {
    /// Numeric rating
    Rating(i64),
    /// Free text; passed through the anonymization transform before persistence
    Text(String),
}

impl Answer {
    pub fn rating(&self) -> Option<i64> {
        match self {
            Answer::Rating(v) => Some(*v),
            Answer::Text(_) => None,
        }
    }
}

/// A response waiting for durable persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingResponse {
    pub survey_id: Uuid,
    pub question_id: Uuid,
    pub answer: Answer,
    /// Distance from the batch mean, derived at enqueue time for rating
    /// answers; zero for everything else. Travels with the record on
    /// inter-instance transfer so receivers never re-derive it.
    #[serde(default)]
    pub discrepancy: f64,
}

impl PendingResponse {
    pub fn new(survey_id: Uuid, question_id: Uuid, answer: Answer) -> Self {
        Self {
            survey_id,
            question_id,
            answer,
            discrepancy: 0.0,
        }
    }
}

/// Derive the discrepancy statistic across one submitted batch.
///
/// The mean is computed over the valid rating answers in the batch only;
/// non-rating answers keep a discrepancy of zero.
pub fn derive_discrepancies(batch: &mut [PendingResponse]) {
    let ratings: Vec<i64> = batch.iter().filter_map(|r| r.answer.rating()).collect();
    if ratings.is_empty() {
        return;
    }
    let mean = ratings.iter().sum::<i64>() as f64 / ratings.len() as f64;
    for record in batch.iter_mut() {
        if let Some(v) = record.answer.rating() {
            record.discrepancy = (v as f64 - mean).abs();
        }
    }
}

/// Flush schedule counters, exposed to operators as-is
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleState {
    pub current_percentage: u32,
    pub next_flush_at: Option<DateTime<Utc>>,
    pub last_flush_at: Option<DateTime<Utc>>,
    pub last_flush_amount: usize,
}

/// Read-only snapshot for observability: counts and timestamps, never content
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub instance_id: String,
    pub is_leader: bool,
    pub is_ready: bool,
    pub pending_total: usize,
    pub surveys_with_pending: usize,
    pub schedule: ScheduleState,
}

struct Inner {
    pending: Vec<PendingResponse>,
    schedule: ScheduleState,
    /// Bumped on every arm and disarm; sleeping timer tasks that wake with a
    /// stale generation exit without firing.
    arm_generation: u64,
    /// True from cycle selection until completion, so firings never overlap
    cycle_in_flight: bool,
}

/// Mutex-guarded queue of pending responses plus the schedule state
pub struct SubmissionQueue {
    inner: Mutex<Inner>,
    min_percentage: u32,
}

impl SubmissionQueue {
    pub fn new(delay: &DelayConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: Vec::new(),
                schedule: ScheduleState {
                    current_percentage: delay.min_percentage,
                    next_flush_at: None,
                    last_flush_at: None,
                    last_flush_amount: 0,
                },
                arm_generation: 0,
                cycle_in_flight: false,
            }),
            min_percentage: delay.min_percentage,
        }
    }

    /// Append a whole batch under one lock acquisition. A batch racing a
    /// firing flush cycle lands entirely in that cycle's pool or entirely in
    /// the next one, never split.
    pub fn enqueue(&self, batch: Vec<PendingResponse>) {
        if batch.is_empty() {
            return;
        }
        let mut inner = self.lock();
        inner.pending.extend(batch);
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    pub fn pending_for(&self, survey_id: Uuid) -> usize {
        self.lock()
            .pending
            .iter()
            .filter(|r| r.survey_id == survey_id)
            .count()
    }

    /// Snapshot of pending counts per survey
    pub fn survey_counts(&self) -> HashMap<Uuid, usize> {
        let inner = self.lock();
        let mut counts = HashMap::new();
        for record in &inner.pending {
            *counts.entry(record.survey_id).or_insert(0) += 1;
        }
        counts
    }

    /// Remove the throttled share of one survey's pending records, selected
    /// uniformly at random. Returns an empty vec while the pending count does
    /// not exceed `floor`; otherwise removes
    /// `min(ceil(pending × percentage / 100), pending − floor)` records.
    pub fn take_random_throttled(
        &self,
        survey_id: Uuid,
        floor: usize,
        percentage: u32,
    ) -> Vec<PendingResponse> {
        let mut inner = self.lock();
        let mut indices: Vec<usize> = inner
            .pending
            .iter()
            .enumerate()
            .filter(|(_, r)| r.survey_id == survey_id)
            .map(|(i, _)| i)
            .collect();

        let pending = indices.len();
        if pending <= floor {
            return Vec::new();
        }
        let throttled = (pending * percentage as usize).div_ceil(100);
        let to_submit = throttled.min(pending - floor);

        let mut rng = rand::thread_rng();
        indices.shuffle(&mut rng);
        indices.truncate(to_submit);
        Self::remove_at(&mut inner.pending, indices)
    }

    /// Remove every pending record for one survey, in random order
    pub fn take_all_for_survey(&self, survey_id: Uuid) -> Vec<PendingResponse> {
        let mut inner = self.lock();
        let indices: Vec<usize> = inner
            .pending
            .iter()
            .enumerate()
            .filter(|(_, r)| r.survey_id == survey_id)
            .map(|(i, _)| i)
            .collect();
        let mut taken = Self::remove_at(&mut inner.pending, indices);
        taken.shuffle(&mut rand::thread_rng());
        taken
    }

    /// Remove everything; used for the demotion and shutdown drains
    pub fn drain_all(&self) -> Vec<PendingResponse> {
        std::mem::take(&mut self.lock().pending)
    }

    fn remove_at(pending: &mut Vec<PendingResponse>, mut indices: Vec<usize>) -> Vec<PendingResponse> {
        // swap_remove from the highest index down so earlier removals don't
        // shift the later ones
        indices.sort_unstable_by(|a, b| b.cmp(a));
        indices.into_iter().map(|i| pending.swap_remove(i)).collect()
    }

    // === Schedule state, same lock ===

    pub fn current_percentage(&self) -> u32 {
        self.lock().schedule.current_percentage
    }

    pub fn is_armed(&self) -> bool {
        self.lock().schedule.next_flush_at.is_some()
    }

    /// Arm the flush timer if it is idle. Returns the new arm generation when
    /// this call armed it, `None` when a timer is already armed or a cycle is
    /// mid-flight (the cycle re-arms on completion).
    pub fn try_arm(&self, next_fire: DateTime<Utc>) -> Option<u64> {
        let mut inner = self.lock();
        if inner.schedule.next_flush_at.is_some() || inner.cycle_in_flight {
            return None;
        }
        inner.arm_generation += 1;
        inner.schedule.next_flush_at = Some(next_fire);
        Some(inner.arm_generation)
    }

    /// Transition Armed → Firing for the given generation. Returns false for
    /// stale timers and while another cycle is in flight.
    pub fn begin_cycle(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if generation != inner.arm_generation || inner.cycle_in_flight {
            return false;
        }
        inner.cycle_in_flight = true;
        inner.schedule.next_flush_at = None;
        true
    }

    /// Complete a firing cycle, recording the flushed amount if any
    pub fn finish_cycle(&self, flushed: usize) {
        let mut inner = self.lock();
        inner.cycle_in_flight = false;
        if flushed > 0 {
            inner.schedule.last_flush_at = Some(Utc::now());
            inner.schedule.last_flush_amount = flushed;
        }
    }

    /// Drop any armed timer; sleeping tasks wake to a stale generation
    pub fn disarm(&self) {
        let mut inner = self.lock();
        inner.arm_generation += 1;
        inner.schedule.next_flush_at = None;
    }

    /// Record a flush performed outside the throttled cycle (administrative)
    pub fn record_flush(&self, amount: usize) {
        let mut inner = self.lock();
        inner.schedule.last_flush_at = Some(Utc::now());
        inner.schedule.last_flush_amount = amount;
    }

    /// Randomized percentage walk after a productive cycle: reset to the
    /// minimum with the configured chance, otherwise increment toward the cap.
    pub fn advance_percentage(&self, delay: &DelayConfig) {
        let reset = rand::thread_rng().gen_range(0..100) < delay.reset_chance_percentage;
        let mut inner = self.lock();
        inner.schedule.current_percentage = if reset {
            delay.min_percentage
        } else {
            (inner.schedule.current_percentage + delay.percentage_increment)
                .min(delay.max_percentage)
        };
    }

    /// Reset the walk to its minimum (after a cycle that flushed nothing)
    pub fn reset_percentage(&self) {
        self.lock().schedule.current_percentage = self.min_percentage;
    }

    /// Operator snapshot; counts and timestamps only
    pub fn status(&self, leadership: &LeadershipState) -> QueueStatus {
        let inner = self.lock();
        let mut surveys: Vec<Uuid> = inner.pending.iter().map(|r| r.survey_id).collect();
        surveys.sort_unstable();
        surveys.dedup();
        QueueStatus {
            instance_id: leadership.instance_id.clone(),
            is_leader: leadership.is_leader,
            is_ready: leadership.is_ready,
            pending_total: inner.pending.len(),
            surveys_with_pending: surveys.len(),
            schedule: inner.schedule.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
