//! Request and command metrics.
//!
//! ## Metrics Exposed
//!
//! - `request` - request count and latency by path pattern, method, status
//! - `verification` - command outcomes (issued, pending, cancelled, ...)
//!
//! Metrics are emitted as structured log events under the
//! `verification_kernel::metrics` target and aggregated downstream.

use std::sync::OnceLock;
use std::time::Instant;

use axum::{extract::Request, middleware::Next, response::Response};
use regex_lite::Regex;
use tracing::{info, warn};

/// Emit one `request` metric per response, labelled by path pattern.
///
/// Server errors are logged at `warn` so they surface without a dashboard.
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let pattern = normalize_path(request.uri().path());
    let method = request.method().as_str().to_owned();
    let started = Instant::now();

    let response = next.run(request).await;

    let status = response.status();
    let latency_ms = started.elapsed().as_millis() as u64;
    let class = status_class(status.as_u16());

    if status.is_server_error() {
        warn!(
            target: "verification_kernel::metrics",
            metric_type = "request",
            path = %pattern,
            method = %method,
            status = status.as_u16(),
            class,
            latency_ms,
            "request_metric"
        );
    } else {
        info!(
            target: "verification_kernel::metrics",
            metric_type = "request",
            path = %pattern,
            method = %method,
            status = status.as_u16(),
            class,
            latency_ms,
            "request_metric"
        );
    }

    response
}

fn status_class(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

/// Normalize path for metrics to avoid high cardinality.
///
/// Identity segments under `/status/` and `/records/` become `:identity`;
/// stray UUIDs become `:id`.
pub fn normalize_path(path: &str) -> String {
    static PATTERNS: OnceLock<Option<(Regex, Regex)>> = OnceLock::new();

    let patterns = PATTERNS.get_or_init(|| {
        let identity = Regex::new(r"/(status|records)/[^/]+").ok()?;
        let uuid = Regex::new(r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}").ok()?;
        Some((identity, uuid))
    });

    match patterns {
        Some((identity, uuid)) => {
            let path = identity.replace_all(path, "/$1/:identity");
            uuid.replace_all(&path, ":id").to_string()
        }
        None => path.to_string(),
    }
}

/// Record the outcome of a verification command.
pub fn record_verification_outcome(command: &str, outcome: &str) {
    info!(
        target: "verification_kernel::metrics",
        metric_type = "verification",
        command = command,
        outcome = outcome,
        "verification_metric"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_segments_collapse() {
        assert_eq!(normalize_path("/api/status/123456789012"), "/api/status/:identity");
        assert_eq!(
            normalize_path("/api/admin/records/jane.doe"),
            "/api/admin/records/:identity"
        );
    }

    #[test]
    fn test_status_class() {
        assert_eq!(status_class(204), "2xx");
        assert_eq!(status_class(409), "4xx");
        assert_eq!(status_class(503), "5xx");
        assert_eq!(status_class(101), "other");
    }

    #[test]
    fn test_uuid_segments_collapse() {
        let path = "/api/other/550e8400-e29b-41d4-a716-446655440000";
        assert_eq!(normalize_path(path), "/api/other/:id");
    }

    #[test]
    fn test_static_paths_untouched() {
        assert_eq!(normalize_path("/health/ready"), "/health/ready");
        assert_eq!(normalize_path("/api/admin/unverified"), "/api/admin/unverified");
    }
}
