//! Outbound webhooks: grant application and notice delivery.
//!
//! The privilege system and the messaging transport sit behind small HTTP
//! contracts so the service stays agnostic of the community platform:
//!
//! - `POST {GRANT_WEBHOOK_URL}/grant`  `{"identity_id": "..."}`
//!   200 granted, 409 already held, 404 identity unknown, 403 refused
//! - `POST {GRANT_WEBHOOK_URL}/revoke-marker`  `{"identity_id": "..."}`
//! - `POST {NOTIFY_WEBHOOK_URL}`  the serialized [`Notice`] plus its audience

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;

use crate::config::env_or;
use crate::error::ConfigError;
use crate::grant::{GrantApplier, GrantError, GrantOutcome};
use crate::notify::{Audience, DeliveryError, Notice, Notifier};
use crate::types::IdentityId;

/// Default timeout for outbound requests.
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default connection timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
        .build()
        .unwrap_or_default()
}

fn outbound_timeout() -> Duration {
    Duration::from_secs(env_or("OUTBOUND_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS))
}

#[derive(Serialize)]
struct IdentityBody<'a> {
    identity_id: &'a IdentityId,
}

/// Grant applier calling an HTTP webhook.
pub struct WebhookGrantApplier {
    http: reqwest::Client,
    base_url: String,
}

impl WebhookGrantApplier {
    /// Create an applier for `base_url`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: http_client(timeout),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Read `GRANT_WEBHOOK_URL` (required) and `OUTBOUND_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = std::env::var("GRANT_WEBHOOK_URL")
            .ok()
            .filter(|u| !u.trim().is_empty())
            .ok_or(ConfigError::Missing("GRANT_WEBHOOK_URL"))?;
        Ok(Self::new(url, outbound_timeout()))
    }

    async fn post(&self, path: &str, identity: &IdentityId) -> Result<StatusCode, GrantError> {
        let response = self
            .http
            .post(format!("{}/{}", self.base_url, path))
            .json(&IdentityBody { identity_id: identity })
            .send()
            .await
            .map_err(|e| GrantError::Unavailable(e.to_string()))?;
        Ok(response.status())
    }
}

/// Map a webhook status code onto the grant contract.
fn grant_result(status: StatusCode) -> Result<GrantOutcome, GrantError> {
    match status {
        s if s.is_success() => Ok(GrantOutcome::Granted),
        StatusCode::CONFLICT => Ok(GrantOutcome::AlreadyGranted),
        StatusCode::NOT_FOUND => Err(GrantError::NotFound),
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
            Err(GrantError::PermissionDenied(format!("webhook answered {status}")))
        }
        s => Err(GrantError::Unavailable(format!("webhook answered {s}"))),
    }
}

#[async_trait]
impl GrantApplier for WebhookGrantApplier {
    async fn grant(&self, identity: &IdentityId) -> Result<GrantOutcome, GrantError> {
        grant_result(self.post("grant", identity).await?)
    }

    async fn revoke_prior_marker(&self, identity: &IdentityId) -> Result<(), GrantError> {
        match self.post("revoke-marker", identity).await? {
            s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(()),
            s => Err(GrantError::Unavailable(format!("webhook answered {s}"))),
        }
    }
}

#[derive(Serialize)]
struct NoticeEnvelope<'a> {
    audience: Audience,
    #[serde(flatten)]
    notice: &'a Notice,
}

/// Notifier posting notices to an HTTP webhook.
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    /// Create a notifier for `url`.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: http_client(timeout),
            url: url.into(),
        }
    }

    /// Read `NOTIFY_WEBHOOK_URL`; `None` when unset.
    pub fn from_env() -> Option<Self> {
        std::env::var("NOTIFY_WEBHOOK_URL")
            .ok()
            .filter(|u| !u.trim().is_empty())
            .map(|url| Self::new(url, outbound_timeout()))
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(&self, notice: Notice) -> Result<(), DeliveryError> {
        let envelope = NoticeEnvelope {
            audience: notice.audience(),
            notice: &notice,
        };
        let response = self
            .http
            .post(&self.url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| DeliveryError(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(DeliveryError(format!("webhook answered {}", response.status())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_status_mapping() {
        assert_eq!(grant_result(StatusCode::OK), Ok(GrantOutcome::Granted));
        assert_eq!(grant_result(StatusCode::NO_CONTENT), Ok(GrantOutcome::Granted));
        assert_eq!(grant_result(StatusCode::CONFLICT), Ok(GrantOutcome::AlreadyGranted));
        assert_eq!(grant_result(StatusCode::NOT_FOUND), Err(GrantError::NotFound));
        assert!(matches!(grant_result(StatusCode::FORBIDDEN), Err(GrantError::PermissionDenied(_))));
        assert!(matches!(
            grant_result(StatusCode::BAD_GATEWAY),
            Err(GrantError::Unavailable(_))
        ));
    }

    #[test]
    fn test_envelope_carries_audience_and_kind() {
        let notice = Notice::Expired { identity_id: IdentityId::new("3") };
        let envelope = NoticeEnvelope { audience: notice.audience(), notice: &notice };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["audience"], "both");
        assert_eq!(json["kind"], "expired");
        assert_eq!(json["identity_id"], "3");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let applier = WebhookGrantApplier::new("https://roles.example.test/", Duration::from_secs(1));
        assert_eq!(applier.base_url, "https://roles.example.test");
    }
}
