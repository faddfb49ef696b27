//! Collaborator boundaries
//!
//! The survey data model, the anonymization service, and survey lifecycle
//! management live outside this crate. They are consumed through the traits
//! here and injected into the node at construction. The memory-backed
//! implementations exist so the binary and the tests can run standalone.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

use crate::common::{Error, Result};
use crate::node::queue::PendingResponse;

/// Durable storage for finalized response records
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Number of questions in a survey, used for flush threshold math
    async fn question_count(&self, survey_id: Uuid) -> Result<usize>;

    /// Persist a batch of response records durably
    async fn persist_responses(&self, survey_id: Uuid, responses: Vec<PendingResponse>)
        -> Result<()>;
}

/// Opaque external text transform applied to free-text answers before
/// persistence. Failure is never fatal to a flush.
#[async_trait]
pub trait TextAnonymizer: Send + Sync {
    async fn anonymize(&self, text: &str) -> Result<String>;
}

/// Survey lifecycle operations delegated from the transfer endpoint
#[async_trait]
pub trait SurveyLifecycle: Send + Sync {
    async fn close_survey(&self, survey_id: Uuid) -> Result<()>;
}

/// Authorization check for the administrative endpoints
pub trait AdminAuth: Send + Sync {
    fn authorize_admin(&self, token: &str) -> bool;
}

/// Bearer-token admin authorization against one configured token
pub struct TokenAdminAuth {
    token: String,
}

impl TokenAdminAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl AdminAuth for TokenAdminAuth {
    fn authorize_admin(&self, token: &str) -> bool {
        !self.token.is_empty() && token == self.token
    }
}

/// In-memory gateway backend (standalone runs and tests)
#[derive(Default)]
pub struct MemoryGateway {
    surveys: Mutex<HashMap<Uuid, usize>>,
    persisted: Mutex<HashMap<Uuid, Vec<PendingResponse>>>,
    closed: Mutex<HashSet<Uuid>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a survey and its question count
    pub fn register_survey(&self, survey_id: Uuid, question_count: usize) {
        self.surveys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(survey_id, question_count);
    }

    pub fn persisted_count(&self, survey_id: Uuid) -> usize {
        self.persisted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&survey_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    pub fn is_closed(&self, survey_id: Uuid) -> bool {
        self.closed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&survey_id)
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn question_count(&self, survey_id: Uuid) -> Result<usize> {
        self.surveys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&survey_id)
            .copied()
            .ok_or(Error::UnknownSurvey(survey_id))
    }

    async fn persist_responses(
        &self,
        survey_id: Uuid,
        responses: Vec<PendingResponse>,
    ) -> Result<()> {
        self.persisted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(survey_id)
            .or_default()
            .extend(responses);
        Ok(())
    }
}

#[async_trait]
impl SurveyLifecycle for MemoryGateway {
    async fn close_survey(&self, survey_id: Uuid) -> Result<()> {
        self.closed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(survey_id);
        Ok(())
    }
}

/// Anonymizer that returns the text unchanged; stands in where no external
/// anonymization service is wired up
pub struct PassthroughAnonymizer;

#[async_trait]
impl TextAnonymizer for PassthroughAnonymizer {
    async fn anonymize(&self, text: &str) -> Result<String> {
        Ok(text.to_string())
    }
}
