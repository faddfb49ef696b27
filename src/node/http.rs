//! HTTP API for a veilq node
//!
//! Two surfaces share one listener: the authenticated inter-instance transfer
//! endpoint and the operator-facing admin/health/metrics endpoints. Every
//! caller-visible failure is a structured envelope; raw faults never leak.

use axum::{
    extract::{Path, Request, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::common::{machine_name, Metrics};
use crate::gateway::{AdminAuth, SurveyLifecycle};
use crate::node::election::LeaderElector;
use crate::node::queue::{QueueStatus, SubmissionQueue};
use crate::node::scheduler::{ArmWindow, DelayScheduler};
use crate::node::transfer::{
    CommunicationType, Envelope, TransferRequest, INSTANCE_SECRET_HEADER,
};

/// Shared node state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<SubmissionQueue>,
    pub elector: Arc<LeaderElector>,
    pub scheduler: Arc<DelayScheduler>,
    pub lifecycle: Arc<dyn SurveyLifecycle>,
    pub admin_auth: Arc<dyn AdminAuth>,
    pub metrics: Arc<Metrics>,
    pub status_tx: broadcast::Sender<QueueStatus>,
    pub instance_secret: String,
}

/// Creates the HTTP router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/admin/status", get(admin_status))
        .route("/admin/flush/:survey_id", post(admin_flush))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ));

    Router::new()
        .route("/internal/transfer", post(receive_transfer))
        .route("/health", get(health))
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/metrics", get(metrics))
        .merge(admin)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Admin authorization middleware; delegates the token check to the injected
/// authorizer
async fn admin_auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    if !state.admin_auth.authorize_admin(token) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "admin authorization required" })),
        )
            .into_response();
    }
    next.run(request).await
}

/// Inbound inter-instance call. Authenticated by the shared instance secret;
/// a receiver that lost leadership reports `successful: false` so the caller
/// re-resolves and retries.
async fn receive_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TransferRequest>,
) -> Response {
    let presented = headers
        .get(INSTANCE_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());
    if presented != Some(state.instance_secret.as_str()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(Envelope::<usize>::failure("invalid instance secret")),
        )
            .into_response();
    }

    match request.communication_type {
        CommunicationType::NoOp => {
            Json(Envelope::<usize>::message_only("acknowledged")).into_response()
        }
        CommunicationType::TransferResponses => {
            if !state.elector.is_leader() {
                return Json(Envelope::<usize>::failure("receiver is not the leader"))
                    .into_response();
            }
            let count = request.responses.len();
            // discrepancy travels with the records; no re-derivation here
            state.queue.enqueue(request.responses);
            state.metrics.received_total.add(count as u64);
            state.metrics.queue_depth.set(state.queue.len() as u64);
            state.scheduler.arm(ArmWindow::Cold);
            tracing::info!(count, source = %request.source_instance_id,
                "responses accepted from follower");
            Json(Envelope::ok("responses accepted", count)).into_response()
        }
        CommunicationType::CloseSurvey => {
            if !state.elector.is_leader() {
                return Json(Envelope::<usize>::failure("receiver is not the leader"))
                    .into_response();
            }
            let Some(survey_id) = request.survey_id else {
                return Json(Envelope::<usize>::failure("survey_id required")).into_response();
            };
            match state.lifecycle.close_survey(survey_id).await {
                Ok(()) => {
                    Json(Envelope::<usize>::message_only("survey closed")).into_response()
                }
                Err(e) => Json(Envelope::<usize>::failure(e.to_string())).into_response(),
            }
        }
    }
}

/// Operator status: machine, timestamp, and the content-free queue snapshot
async fn admin_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.queue.status(&state.elector.state());
    Json(json!({
        "machine_name": machine_name(state.elector.instance_id()),
        "timestamp": Utc::now(),
        "status": status,
    }))
}

/// Administrative immediate flush of one survey
async fn admin_flush(State(state): State<AppState>, Path(survey_id): Path<Uuid>) -> Response {
    match state.scheduler.flush_survey(survey_id).await {
        Ok(count) => {
            let _ = state.status_tx.send(state.queue.status(&state.elector.state()));
            Json(Envelope::ok("survey flushed", count)).into_response()
        }
        Err(e) => (
            e.to_http_status(),
            Json(Envelope::<usize>::failure(e.to_string())),
        )
            .into_response(),
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let leadership = state.elector.state();
    Json(json!({
        "status": "healthy",
        "is_leader": leadership.is_leader,
        "is_ready": leadership.is_ready,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Liveness probe: responding means alive
async fn health_live() -> impl IntoResponse {
    Json(json!({
        "alive": true,
        "timestamp": Utc::now(),
    }))
}

/// Readiness probe: ready once election has stabilized at least once
async fn health_ready(State(state): State<AppState>) -> impl IntoResponse {
    let leadership = state.elector.state();
    if leadership.is_ready {
        (
            StatusCode::OK,
            Json(json!({ "ready": true, "is_leader": leadership.is_leader })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ready": false, "reason": "election not stabilized" })),
        )
    }
}

/// Prometheus metrics endpoint; counts and gauges only
async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.queue_depth.set(state.queue.len() as u64);
    (StatusCode::OK, state.metrics.to_prometheus())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{DelayConfig, ElectionConfig};
    use crate::gateway::{
        MemoryGateway, PassthroughAnonymizer, PersistenceGateway, TextAnonymizer, TokenAdminAuth,
    };
    use crate::node::coordination::{CoordinationStore, MemoryCoordinationStore};
    use crate::node::queue::{Answer, PendingResponse};
    use axum::body::Body;
    use tower::ServiceExt;

    const SECRET: &str = "fleet-secret";
    const ADMIN_TOKEN: &str = "ops-token";

    struct Fixture {
        router: Router,
        state: AppState,
        gateway: Arc<MemoryGateway>,
    }

    fn fixture(leader: bool) -> Fixture {
        let delay = DelayConfig::default();
        let queue = Arc::new(SubmissionQueue::new(&delay));
        let store = Arc::new(MemoryCoordinationStore::new());
        let elector = Arc::new(LeaderElector::new(
            "local:1".into(),
            store as Arc<dyn CoordinationStore>,
            ElectionConfig::default(),
            leader,
        ));
        let gateway = Arc::new(MemoryGateway::new());
        let metrics = Arc::new(Metrics::default());
        let scheduler = Arc::new(DelayScheduler::new(
            queue.clone(),
            gateway.clone() as Arc<dyn PersistenceGateway>,
            Arc::new(PassthroughAnonymizer) as Arc<dyn TextAnonymizer>,
            elector.clone(),
            delay,
            metrics.clone(),
        ));
        let (status_tx, _) = broadcast::channel(16);
        let state = AppState {
            queue,
            elector,
            scheduler,
            lifecycle: gateway.clone() as Arc<dyn SurveyLifecycle>,
            admin_auth: Arc::new(TokenAdminAuth::new(ADMIN_TOKEN)),
            metrics,
            status_tx,
            instance_secret: SECRET.into(),
        };
        Fixture {
            router: create_router(state.clone()),
            state,
            gateway,
        }
    }

    fn transfer_request(communication_type: CommunicationType, n: usize) -> TransferRequest {
        let survey = Uuid::new_v4();
        TransferRequest {
            source_instance_id: "follower:2".into(),
            communication_type,
            responses: (0..n)
                .map(|i| PendingResponse::new(survey, Uuid::new_v4(), Answer::Rating(i as i64)))
                .collect(),
            survey_id: None,
        }
    }

    fn post_transfer(body: &TransferRequest, secret: Option<&str>) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder()
            .method("POST")
            .uri("/internal/transfer")
            .header("content-type", "application/json");
        if let Some(s) = secret {
            builder = builder.header(INSTANCE_SECRET_HEADER, s);
        }
        builder
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_transfer_requires_secret() {
        let f = fixture(true);
        let request = transfer_request(CommunicationType::NoOp, 0);

        let response = f.router.clone().oneshot(post_transfer(&request, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = f
            .router
            .oneshot(post_transfer(&request, Some("wrong")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_transfer_noop_acknowledged() {
        let f = fixture(true);
        let request = transfer_request(CommunicationType::NoOp, 0);
        let response = f
            .router
            .oneshot(post_transfer(&request, Some(SECRET)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["successful"], true);
    }

    #[tokio::test]
    async fn test_transfer_responses_accepted_by_leader() {
        let f = fixture(true);
        let request = transfer_request(CommunicationType::TransferResponses, 5);
        let response = f
            .router
            .oneshot(post_transfer(&request, Some(SECRET)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["successful"], true);
        assert_eq!(json["data"], 5);
        assert_eq!(f.state.queue.len(), 5);
        assert!(f.state.queue.is_armed());
    }

    #[tokio::test]
    async fn test_transfer_responses_rejected_by_follower() {
        let f = fixture(false);
        let request = transfer_request(CommunicationType::TransferResponses, 3);
        let response = f
            .router
            .oneshot(post_transfer(&request, Some(SECRET)))
            .await
            .unwrap();
        // an envelope failure, not an HTTP error: the caller re-resolves
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["successful"], false);
        assert_eq!(f.state.queue.len(), 0);
    }

    #[tokio::test]
    async fn test_close_survey_delegates() {
        let f = fixture(true);
        let survey = Uuid::new_v4();
        let mut request = transfer_request(CommunicationType::CloseSurvey, 0);
        request.survey_id = Some(survey);

        let response = f
            .router
            .oneshot(post_transfer(&request, Some(SECRET)))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["successful"], true);
        assert!(f.gateway.is_closed(survey));
    }

    #[tokio::test]
    async fn test_admin_requires_token() {
        let f = fixture(true);
        let request = axum::http::Request::builder()
            .uri("/admin/status")
            .body(Body::empty())
            .unwrap();
        let response = f.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_admin_status_is_content_free() {
        let f = fixture(true);
        f.state.queue.enqueue(vec![PendingResponse::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Answer::Text("sensitive feedback".into()),
        )]);

        let request = axum::http::Request::builder()
            .uri("/admin/status")
            .header(AUTHORIZATION, format!("Bearer {}", ADMIN_TOKEN))
            .body(Body::empty())
            .unwrap();
        let response = f.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert!(json.get("machine_name").is_some());
        assert_eq!(json["status"]["pending_total"], 1);
        // counts and timestamps only; the answer text never appears
        assert!(!json.to_string().contains("sensitive feedback"));
    }

    #[tokio::test]
    async fn test_admin_flush_empty_survey_returns_zero() {
        let f = fixture(true);
        let request = axum::http::Request::builder()
            .method("POST")
            .uri(format!("/admin/flush/{}", Uuid::new_v4()))
            .header(AUTHORIZATION, format!("Bearer {}", ADMIN_TOKEN))
            .body(Body::empty())
            .unwrap();
        let response = f.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["successful"], true);
        assert_eq!(json["data"], 0);
    }

    #[tokio::test]
    async fn test_admin_flush_rejected_on_follower() {
        let f = fixture(false);
        let request = axum::http::Request::builder()
            .method("POST")
            .uri(format!("/admin/flush/{}", Uuid::new_v4()))
            .header(AUTHORIZATION, format!("Bearer {}", ADMIN_TOKEN))
            .body(Body::empty())
            .unwrap();
        let response = f.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["successful"], false);
    }

    #[tokio::test]
    async fn test_readiness_follows_election() {
        let f = fixture(false);
        let request = axum::http::Request::builder()
            .uri("/health/ready")
            .body(Body::empty())
            .unwrap();
        let response = f.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let f = fixture(true);
        let request = axum::http::Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let response = f.router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("veilq_queue_depth"));
    }
}
