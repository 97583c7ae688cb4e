//! Verification Service Binary
//!
//! Runs the verification engine behind a REST API. Logs are JSON unless
//! `LOG_FORMAT=pretty`; every request gets an `X-Request-Id` correlation id.
//! On startup pending pollers are resumed and the expiry sweeper starts; on
//! SIGTERM or Ctrl+C the server drains and background tasks are stopped.
//!
//! ## Configuration
//!
//! - `DATABASE_URL`: record store connection string (required)
//! - `DB_STARTUP_TIMEOUT_SECS`: startup connection limit (default: 30)
//! - `LEDGER_SHEET_ID`, `LEDGER_ACCESS_TOKEN`: ledger spreadsheet (required)
//! - `GRANT_WEBHOOK_URL`: privilege webhook (required)
//! - `NOTIFY_WEBHOOK_URL`: notice webhook (optional; notices are logged otherwise)
//! - `ADMIN_TOKEN`: token for admin routes (optional; admin routes disabled otherwise)
//! - `PORT`: Service port (default: 8002)
//! - `HOST`: bind address (default: 0.0.0.0)
//! - `RUST_LOG`: filter directives (default: info for this crate)
//! - `LOG_FORMAT`: `json` (default) or `pretty`
//!
//! Engine tuning variables are listed in `verification_kernel::config`.
//!
//! ## Usage
//!
//! ```bash
//! DATABASE_URL=postgresql://... LEDGER_SHEET_ID=... LEDGER_ACCESS_TOKEN=... \
//!   GRANT_WEBHOOK_URL=... cargo run --bin verification_service --features service
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, Instrument};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use verification_kernel::ledger::sheets::{SheetsConfig, SheetsLedgerClient};
use verification_kernel::notify::{Notifier, TracingNotifier};
use verification_kernel::service::{
    create_router, metrics_middleware, ServiceState, WebhookGrantApplier, WebhookNotifier,
};
use verification_kernel::{PostgresRecordStore, VerificationConfig, VerificationEngine};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Install the global subscriber. `LOG_FORMAT=pretty` switches to
/// human-readable output; anything else logs flattened JSON.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "verification_service=info,verification_kernel=info,tower_http=info,sqlx=warn".into()
    });
    let pretty = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("pretty"));
    let registry = tracing_subscriber::registry().with(filter);

    if pretty {
        registry
            .with(fmt::layer().with_target(true).with_span_events(FmtSpan::CLOSE))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_target(true),
            )
            .init();
    }
}

/// Correlation id for a request: the caller's `X-Request-Id` if it sent a
/// usable one, a fresh v4 uuid otherwise.
fn correlation_id(request: &Request) -> String {
    request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string)
}

/// Access log: wraps each request in a span keyed by its correlation id and
/// echoes the id back on the response.
async fn access_log_middleware(request: Request, next: Next) -> Response {
    let trace_id = correlation_id(&request);
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let span = info_span!(
        "request",
        trace_id = %trace_id,
        method = %method,
        path = %path,
        status = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
    );

    let mut response = next.run(request).instrument(span.clone()).await;

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let status = response.status().as_u16();
    span.record("status", status);
    span.record("latency_ms", elapsed_ms);

    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    info!(
        target: "verification_service::access",
        trace_id = %trace_id,
        method = %method,
        path = %path,
        status,
        latency_ms = elapsed_ms,
        "request completed"
    );

    response
}

/// Connect to Postgres within `DB_STARTUP_TIMEOUT_SECS` and make sure the
/// record table exists.
async fn connect_store() -> Result<PostgresRecordStore, Box<dyn std::error::Error>> {
    let limit = Duration::from_secs(verification_kernel::config::env_or("DB_STARTUP_TIMEOUT_SECS", 30));
    let started = Instant::now();
    info!(timeout_secs = limit.as_secs(), "Connecting to record store");

    let store = tokio::time::timeout(limit, PostgresRecordStore::from_env())
        .await
        .map_err(|_| {
            tracing::error!(timeout_secs = limit.as_secs(), "Record store connection timed out");
            "record store connection timed out"
        })?
        .map_err(|e| {
            tracing::error!(error = %e, "Record store connection failed");
            e
        })?;
    store.ensure_schema().await?;

    info!(
        latency_ms = started.elapsed().as_millis() as u64,
        "Record store ready"
    );
    Ok(store)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let version = env!("CARGO_PKG_VERSION");
    let build_sha = option_env!("BUILD_SHA").unwrap_or("dev");
    info!(version = version, build_sha = build_sha, "Starting Verification Service");

    let port: u16 = verification_kernel::config::env_or("PORT", 8002);
    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

    let config = VerificationConfig::from_env();
    info!(
        code_ttl_secs = config.code_ttl.as_secs(),
        poll_interval_secs = config.poll.interval.as_secs(),
        poll_max_ticks = config.poll.max_ticks,
        domain_policy = config.domain_policy.is_some(),
        "Engine configuration loaded"
    );

    let store = connect_store().await?;

    let sheets = SheetsConfig::from_env()?;
    info!(range = %sheets.data_range(), "Ledger configured");
    let ledger = SheetsLedgerClient::new(sheets)?;

    let grants = WebhookGrantApplier::from_env()?;
    let notifier: Arc<dyn Notifier> = match WebhookNotifier::from_env() {
        Some(webhook) => Arc::new(webhook),
        None => {
            tracing::warn!("NOTIFY_WEBHOOK_URL not set, notices are only logged");
            Arc::new(TracingNotifier)
        }
    };

    let engine = VerificationEngine::new(
        Arc::new(store),
        Arc::new(ledger),
        Arc::new(grants),
        notifier,
        config,
    )?;

    let resumed = engine.resume_pending().await?;
    info!(resumed, "Pending verifications resumed");

    let (sweeper_stop, sweeper_rx) = watch::channel(false);
    let sweeper = engine.spawn_sweeper(sweeper_rx);

    let state = ServiceState::from_env(engine.clone());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(state)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(access_log_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!(address = %addr, version = version, "Verification Service listening");

    let listener = TcpListener::bind(addr).await?;
    info!("Ready to accept connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = sweeper_stop.send(true);
    engine.shutdown();
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "Sweeper task ended abnormally");
    }

    info!("Verification Service shutdown complete");
    Ok(())
}
