//! Inter-instance transfer protocol
//!
//! Followers never hold responses longer than they must: batches are
//! forwarded to the current leader over an authenticated HTTP call with a
//! short fixed timeout, so an unreachable leader cannot stall the submission
//! path. On failure the caller keeps the batch queued locally and retries on
//! the next trigger — records are never dropped silently and failures are
//! logged without content.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::common::{timestamp_now_millis, Error, Result};
use crate::node::coordination::CoordinationStore;
use crate::node::queue::PendingResponse;

/// Header carrying the shared instance secret
pub const INSTANCE_SECRET_HEADER: &str = "x-veilq-instance-secret";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationType {
    NoOp,
    TransferResponses,
    CloseSurvey,
}

/// Body of an inter-instance call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub source_instance_id: String,
    pub communication_type: CommunicationType,
    #[serde(default)]
    pub responses: Vec<PendingResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub survey_id: Option<Uuid>,
}

/// Structured result envelope returned by every endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "T: serde::Serialize",
    deserialize = "T: serde::Deserialize<'de>"
))]
pub struct Envelope<T> {
    pub successful: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            successful: true,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Success acknowledgment that carries no data
    pub fn message_only(message: impl Into<String>) -> Self {
        Self {
            successful: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            successful: false,
            message: message.into(),
            data: None,
        }
    }
}

/// Outcome of a forwarding attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The leader acknowledged this many records
    Sent(usize),
    /// This instance turned out to hold leadership itself; nothing was sent
    /// and the caller must keep the batch
    SelfLeader,
}

/// Client side of the transfer protocol
pub struct TransferClient {
    http: reqwest::Client,
    store: Arc<dyn CoordinationStore>,
    instance_id: String,
    secret: String,
}

impl TransferClient {
    pub fn new(
        instance_id: String,
        secret: String,
        store: Arc<dyn CoordinationStore>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            store,
            instance_id,
            secret,
        })
    }

    /// Forward a batch of responses to the current leader. No-op success when
    /// the batch is empty or this instance is itself the leader; in the
    /// latter case the caller keeps the batch in its own queue.
    pub async fn transfer_to_leader(&self, responses: Vec<PendingResponse>) -> Result<Delivery> {
        if responses.is_empty() {
            return Ok(Delivery::Sent(0));
        }
        let (holder, addr) = self.resolve_leader().await?;
        if holder == self.instance_id {
            return Ok(Delivery::SelfLeader);
        }

        let count = responses.len();
        let request = TransferRequest {
            source_instance_id: self.instance_id.clone(),
            communication_type: CommunicationType::TransferResponses,
            responses,
            survey_id: None,
        };
        let envelope: Envelope<usize> = self.post(&addr, &request).await?;
        if !envelope.successful {
            return Err(Error::TransferFailed(envelope.message));
        }
        Ok(Delivery::Sent(envelope.data.unwrap_or(count)))
    }

    /// Forward a survey-close request to the leader
    pub async fn close_survey_on_leader(&self, survey_id: Uuid) -> Result<()> {
        let (_, addr) = self.resolve_leader().await?;
        let request = TransferRequest {
            source_instance_id: self.instance_id.clone(),
            communication_type: CommunicationType::CloseSurvey,
            responses: Vec::new(),
            survey_id: Some(survey_id),
        };
        let envelope: Envelope<()> = self.post(&addr, &request).await?;
        if !envelope.successful {
            return Err(Error::TransferFailed(envelope.message));
        }
        Ok(())
    }

    /// Liveness probe of the leader's transfer endpoint
    pub async fn ping_leader(&self) -> Result<()> {
        let (_, addr) = self.resolve_leader().await?;
        let request = TransferRequest {
            source_instance_id: self.instance_id.clone(),
            communication_type: CommunicationType::NoOp,
            responses: Vec::new(),
            survey_id: None,
        };
        let envelope: Envelope<()> = self.post(&addr, &request).await?;
        if !envelope.successful {
            return Err(Error::TransferFailed(envelope.message));
        }
        Ok(())
    }

    /// Resolve the current leader's identity and transfer address from the
    /// shared directory.
    async fn resolve_leader(&self) -> Result<(String, String)> {
        let lease = self.store.current_lease().await?.ok_or(Error::NoLeader)?;
        if lease.is_expired(timestamp_now_millis()) {
            return Err(Error::NoLeader);
        }
        let addr = self
            .store
            .lookup_address(&lease.holder_id)
            .await?
            .ok_or_else(|| {
                Error::TransferFailed(format!("no address registered for leader {}", lease.holder_id))
            })?;
        Ok((lease.holder_id, addr))
    }

    async fn post<T: DeserializeOwned>(
        &self,
        addr: &str,
        request: &TransferRequest,
    ) -> Result<Envelope<T>> {
        let url = format!("http://{}/internal/transfer", addr);
        let response = self
            .http
            .post(&url)
            .header(INSTANCE_SECRET_HEADER, &self.secret)
            .json(request)
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(Error::Unauthorized("instance secret rejected".into()));
        }
        if !response.status().is_success() {
            return Err(Error::Http(format!(
                "transfer endpoint returned {}",
                response.status()
            )));
        }
        Ok(response.json::<Envelope<T>>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::coordination::MemoryCoordinationStore;
    use crate::node::queue::Answer;

    fn client(store: Arc<MemoryCoordinationStore>) -> TransferClient {
        TransferClient::new(
            "follower:1".into(),
            "fleet-secret".into(),
            store as Arc<dyn CoordinationStore>,
            Duration::from_millis(500),
        )
        .unwrap()
    }

    fn batch(n: usize) -> Vec<PendingResponse> {
        let survey = Uuid::new_v4();
        (0..n)
            .map(|i| PendingResponse::new(survey, Uuid::new_v4(), Answer::Rating(i as i64)))
            .collect()
    }

    #[test]
    fn test_request_wire_shape() {
        let request = TransferRequest {
            source_instance_id: "a:1".into(),
            communication_type: CommunicationType::TransferResponses,
            responses: batch(1),
            survey_id: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["communication_type"], "transfer_responses");
        assert_eq!(json["responses"].as_array().unwrap().len(), 1);
        assert!(json.get("survey_id").is_none());

        let back: TransferRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back.communication_type, CommunicationType::TransferResponses);
    }

    #[test]
    fn test_envelope_roundtrip() {
        let envelope: Envelope<usize> = Envelope::ok("accepted", 5);
        let json = serde_json::to_string(&envelope).unwrap();
        let back: Envelope<usize> = serde_json::from_str(&json).unwrap();
        assert!(back.successful);
        assert_eq!(back.data, Some(5));

        let failure: Envelope<usize> = Envelope::failure("not leader");
        assert!(!failure.successful);
        assert!(failure.data.is_none());
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let c = client(store);
        assert_eq!(
            c.transfer_to_leader(Vec::new()).await.unwrap(),
            Delivery::Sent(0)
        );
    }

    #[tokio::test]
    async fn test_no_leader_fails() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let c = client(store);
        assert!(matches!(
            c.transfer_to_leader(batch(2)).await,
            Err(Error::NoLeader)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_leader_fails() {
        let store = Arc::new(MemoryCoordinationStore::new());
        store
            .acquire_or_renew("leader:9", Duration::from_secs(30))
            .await
            .unwrap();
        store
            .register_address("leader:9", "127.0.0.1:1")
            .await
            .unwrap();

        let c = client(store);
        assert!(c.transfer_to_leader(batch(2)).await.is_err());
    }

    #[tokio::test]
    async fn test_self_leader_is_noop() {
        let store = Arc::new(MemoryCoordinationStore::new());
        store
            .acquire_or_renew("follower:1", Duration::from_secs(30))
            .await
            .unwrap();
        // every instance advertises its own address in production
        // (see spawn_address_registration); mirror that here
        store
            .register_address("follower:1", "follower:1")
            .await
            .unwrap();
        let c = client(store);
        assert_eq!(
            c.transfer_to_leader(batch(3)).await.unwrap(),
            Delivery::SelfLeader
        );
    }
}
