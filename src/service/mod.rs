//! Verification REST Service
//!
//! Exposes the verification engine as a REST API.
//!
//! ## Endpoints
//!
//! - `POST /api/verify` - Issue a code (or re-deliver the pending one)
//! - `POST /api/retry` - Withdraw the caller's pending verification
//! - `GET /api/status/:identity` - Status of one identity
//! - `GET /api/admin/records/:identity` - Admin inspect (`X-Admin-Token`)
//! - `DELETE /api/admin/records/:identity` - Admin reset (`X-Admin-Token`)
//! - `GET /api/admin/unverified` - Admin list of pending records (`X-Admin-Token`)
//! - `GET /health` - Detailed service health check
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe

pub mod middleware;
pub mod outbound;
pub mod routes;
pub mod state;

pub use middleware::{metrics_middleware, record_verification_outcome};
pub use outbound::{WebhookGrantApplier, WebhookNotifier};
pub use routes::{create_router, AppState};
pub use state::{ServiceState, StoreHealth};
