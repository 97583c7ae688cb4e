//! Axum routes for the verification service.

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::RequestOutcome;
use crate::error::VerificationError;
use crate::store::postgres::PoolStats;
use crate::store::{PostgresRecordStore, RecordStore};
use crate::types::{IdentityId, Requester, StatusReport, VerificationCode, VerificationRecord};

use super::middleware::record_verification_outcome;
use super::state::{ServiceState, StoreHealth};

/// Type alias for the service state with PostgresRecordStore.
pub type AppState = ServiceState<PostgresRecordStore>;

/// Header carrying the admin token.
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request to start a verification cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    /// Requester identity.
    pub identity_id: String,
    /// Identity text the requester must submit on the form.
    pub display_name: String,
}

/// Request to withdraw a pending verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRequest {
    /// Requester identity.
    pub identity_id: String,
}

/// Answer to a verify request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResponse {
    /// `issued` or `pending`.
    pub outcome: String,
    /// Code to submit.
    pub code: VerificationCode,
    /// Expiry.
    pub expires_at: DateTime<Utc>,
    /// Seconds left.
    pub remaining_secs: i64,
    /// Identity text to submit with the code.
    pub identity_text: String,
    /// Form link, when configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form_link: Option<String>,
}

/// Answer to a retry request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryResponse {
    /// Always true on success.
    pub cancelled: bool,
    /// Code that was withdrawn.
    pub code: VerificationCode,
}

/// Pending record as listed to admins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingEntry {
    /// Identity.
    pub identity_id: IdentityId,
    /// Identity text.
    pub identity_text: String,
    /// Code.
    pub code: VerificationCode,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry.
    pub expires_at: DateTime<Utc>,
}

impl From<VerificationRecord> for PendingEntry {
    fn from(record: VerificationRecord) -> Self {
        Self {
            identity_id: record.identity_id,
            identity_text: record.identity_text,
            code: record.code,
            created_at: record.created_at,
            expires_at: record.expires_at,
        }
    }
}

/// List of pending records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingListResponse {
    /// Pending records, oldest first.
    pub records: Vec<PendingEntry>,
    /// Number of records.
    pub count: usize,
}

/// Admin reset answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetResponse {
    /// Identity that was reset.
    pub identity_id: IdentityId,
    /// Whether the removed record had been verified.
    pub was_verified: bool,
}

/// Service health response (detailed).
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Identities with a running poller.
    pub active_pollers: usize,
    /// Database connectivity status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseHealth>,
}

/// Database health information.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseHealth {
    pub connected: bool,
    #[serde(flatten)]
    pub pool: Option<PoolStats>,
}

/// Simple liveness response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessResponse {
    pub status: String,
}

/// Readiness response with dependency status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub database: bool,
    pub details: Option<String>,
}

/// Structured error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable error message.
    pub error: String,
    /// Machine-readable error code.
    pub code: String,
    /// Additional error details (optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    /// Create a new error response with code and message.
    pub fn new(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
            details: None,
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> axum::response::Response {
        tracing::warn!(code = %self.code, error = %self.error, "Request error");
        (StatusCode::BAD_REQUEST, Json(self)).into_response()
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Translate an engine error into an HTTP status and body.
fn api_error(err: VerificationError) -> ApiError {
    let status = match &err {
        VerificationError::NotFound(_) => StatusCode::NOT_FOUND,
        VerificationError::AlreadyVerified(_) | VerificationError::DuplicateRequest { .. } => {
            StatusCode::CONFLICT
        }
        VerificationError::Expired(_) => StatusCode::GONE,
        VerificationError::LedgerUnavailable(_) | VerificationError::GrantUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        VerificationError::InvalidTransition { .. } | VerificationError::DomainNotAllowed(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        VerificationError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(code = err.code(), error = %err, "Command failed");
    }
    (status, Json(ErrorResponse::new(err.code(), err.to_string())))
}

fn require_admin<S: RecordStore + 'static>(state: &ServiceState<S>, headers: &HeaderMap) -> Result<(), ApiError> {
    let presented = headers.get(ADMIN_TOKEN_HEADER).and_then(|v| v.to_str().ok());
    if state.admin_allowed(presented) {
        Ok(())
    } else {
        Err((
            StatusCode::FORBIDDEN,
            Json(ErrorResponse::new("ADMIN_REQUIRED", "admin token missing or invalid")),
        ))
    }
}

fn parse_identity(raw: &str) -> Result<IdentityId, ApiError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("INVALID_IDENTITY", "identity_id must not be empty")),
        ));
    }
    Ok(IdentityId::new(trimmed))
}

// ============================================================================
// Route Handlers
// ============================================================================

/// Start a verification cycle, or re-deliver the pending code.
async fn verify_handler<S: RecordStore + StoreHealth + 'static>(
    State(state): State<Arc<ServiceState<S>>>,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let identity_id = parse_identity(&request.identity_id)?;
    let outcome = state
        .engine
        .request(Requester::new(identity_id, request.display_name))
        .await
        .map_err(api_error)?;

    let label = match &outcome {
        RequestOutcome::Issued(_) => "issued",
        RequestOutcome::Pending { .. } => "pending",
        RequestOutcome::AlreadyVerified(_) => "already_verified",
    };
    record_verification_outcome("verify", label);

    if let RequestOutcome::AlreadyVerified(record) = &outcome {
        return Err(api_error(VerificationError::AlreadyVerified(record.identity_id.clone())));
    }

    let now = Utc::now();
    let record = outcome.record();
    Ok(Json(VerifyResponse {
        outcome: label.to_string(),
        code: record.code.clone(),
        expires_at: record.expires_at,
        remaining_secs: record.remaining(now).num_seconds(),
        identity_text: record.identity_text.clone(),
        form_link: state.engine.config().form_link.clone(),
    }))
}

/// Withdraw the caller's pending verification.
async fn retry_handler<S: RecordStore + StoreHealth + 'static>(
    State(state): State<Arc<ServiceState<S>>>,
    Json(request): Json<RetryRequest>,
) -> Result<Json<RetryResponse>, ApiError> {
    let identity_id = parse_identity(&request.identity_id)?;
    let record = state.engine.retry(&identity_id).await.map_err(api_error)?;
    record_verification_outcome("retry", "cancelled");
    Ok(Json(RetryResponse {
        cancelled: true,
        code: record.code,
    }))
}

/// Status of one identity.
async fn status_handler<S: RecordStore + StoreHealth + 'static>(
    State(state): State<Arc<ServiceState<S>>>,
    Path(identity): Path<String>,
) -> Result<Json<StatusReport>, ApiError> {
    let identity_id = parse_identity(&identity)?;
    state.engine.status(&identity_id).await.map(Json).map_err(api_error)
}

/// Admin: inspect any identity.
async fn inspect_handler<S: RecordStore + StoreHealth + 'static>(
    State(state): State<Arc<ServiceState<S>>>,
    headers: HeaderMap,
    Path(identity): Path<String>,
) -> Result<Json<StatusReport>, ApiError> {
    require_admin(&state, &headers)?;
    let identity_id = parse_identity(&identity)?;
    state.engine.inspect(&identity_id).await.map(Json).map_err(api_error)
}

/// Admin: delete any identity's record.
async fn reset_handler<S: RecordStore + StoreHealth + 'static>(
    State(state): State<Arc<ServiceState<S>>>,
    headers: HeaderMap,
    Path(identity): Path<String>,
) -> Result<Json<ResetResponse>, ApiError> {
    require_admin(&state, &headers)?;
    let identity_id = parse_identity(&identity)?;
    let record = state.engine.reset(&identity_id).await.map_err(api_error)?;
    record_verification_outcome("reset", if record.verified { "verified_removed" } else { "pending_removed" });
    Ok(Json(ResetResponse {
        identity_id,
        was_verified: record.verified,
    }))
}

/// Admin: list pending records.
async fn list_unverified_handler<S: RecordStore + StoreHealth + 'static>(
    State(state): State<Arc<ServiceState<S>>>,
    headers: HeaderMap,
) -> Result<Json<PendingListResponse>, ApiError> {
    require_admin(&state, &headers)?;
    let records: Vec<PendingEntry> = state
        .engine
        .list_unverified()
        .await
        .map_err(api_error)?
        .into_iter()
        .map(PendingEntry::from)
        .collect();
    Ok(Json(PendingListResponse {
        count: records.len(),
        records,
    }))
}

/// Health check endpoint (detailed).
async fn health_handler<S: RecordStore + StoreHealth + 'static>(
    State(state): State<Arc<ServiceState<S>>>,
) -> Json<HealthResponse> {
    let store = state.engine.store();
    let db_healthy = store.is_healthy().await;

    Json(HealthResponse {
        status: if db_healthy { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_pollers: state.engine.registry().active_count(),
        database: Some(DatabaseHealth {
            connected: db_healthy,
            pool: store.pool_stats(),
        }),
    })
}

/// Liveness probe endpoint. Does NOT check dependencies.
async fn liveness_handler() -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "alive".to_string(),
    })
}

/// Readiness probe endpoint. 200 if the store answers, 503 otherwise.
async fn readiness_handler<S: RecordStore + StoreHealth + 'static>(
    State(state): State<Arc<ServiceState<S>>>,
) -> Result<Json<ReadinessResponse>, (StatusCode, Json<ReadinessResponse>)> {
    if state.engine.store().is_healthy().await {
        Ok(Json(ReadinessResponse {
            ready: true,
            database: true,
            details: None,
        }))
    } else {
        Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                ready: false,
                database: false,
                details: Some("Database connection failed".to_string()),
            }),
        ))
    }
}

// ============================================================================
// Router Construction
// ============================================================================

/// Create the Axum router for the verification service.
pub fn create_router<S: RecordStore + StoreHealth + 'static>(state: ServiceState<S>) -> Router {
    let state = Arc::new(state);

    Router::new()
        // Requester commands
        .route("/api/verify", post(verify_handler::<S>))
        .route("/api/retry", post(retry_handler::<S>))
        .route("/api/status/:identity", get(status_handler::<S>))
        // Admin commands
        .route(
            "/api/admin/records/:identity",
            get(inspect_handler::<S>).delete(reset_handler::<S>),
        )
        .route("/api/admin/unverified", get(list_unverified_handler::<S>))
        // Health checks
        .route("/health", get(health_handler::<S>))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler::<S>))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::config::VerificationConfig;
    use crate::engine::VerificationEngine;
    use crate::grant::InMemoryGrantApplier;
    use crate::ledger::InMemoryLedger;
    use crate::notify::RecordingNotifier;
    use crate::store::InMemoryRecordStore;

    fn router() -> (Router, VerificationEngine<InMemoryRecordStore>) {
        let engine = VerificationEngine::new(
            Arc::new(InMemoryRecordStore::new()),
            Arc::new(InMemoryLedger::new()),
            Arc::new(InMemoryGrantApplier::new()),
            Arc::new(RecordingNotifier::new()),
            VerificationConfig { reminder: None, ..VerificationConfig::default() },
        )
        .unwrap();
        let state = ServiceState::new(engine.clone(), Some("admin".to_string()));
        (create_router(state), engine)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_verify_then_status() {
        let (app, engine) = router();
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/verify",
                serde_json::json!({"identity_id": "42", "display_name": "john_doe"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["outcome"], "issued");
        assert_eq!(body["code"].as_str().unwrap().len(), 8);

        let response = app
            .oneshot(Request::get("/api/status/42").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["status"], "pending");
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_retry_unknown_identity_is_404() {
        let (app, _engine) = router();
        let response = app
            .oneshot(json_request("POST", "/api/retry", serde_json::json!({"identity_id": "nobody"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_admin_routes_require_token() {
        let (app, _engine) = router();
        let response = app
            .clone()
            .oneshot(Request::get("/api/admin/unverified").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .oneshot(
                Request::get("/api/admin/unverified")
                    .header(ADMIN_TOKEN_HEADER, "admin")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["count"], 0);
    }

    #[tokio::test]
    async fn test_readiness_with_memory_store() {
        let (app, _engine) = router();
        let response = app
            .oneshot(Request::get("/health/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
