//! Messaging backends.
//!
//! Every backend implements [`Backend`]: one `send` against its own wire
//! protocol, reporting a [`DeliveryOutcome`]. Backends never retry and never
//! touch the outbox; the dispatcher owns both decisions.
//! - `templated`: template-rendering email service (JSON envelope + template params)
//! - `transactional`: transactional mail API with bearer key
//! - `vendor`: provider that needs a server-side integration (explicit no-op)
//! - `sandbox`: sandbox delivery endpoint with bearer token

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Request};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{App, Backends};
use crate::model::{BackendId, NotificationPayload, Recipient};

pub mod sandbox;
pub mod templated;
pub mod transactional;
pub mod vendor;

pub use sandbox::SandboxBackend;
pub use templated::TemplatedBackend;
pub use transactional::TransactionalBackend;
pub use vendor::VendorBackend;

/// A composed message ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub recipient: Recipient,
    pub subject: String,
    pub text: String,
    pub html: String,
    /// Structured source of the message, when there is one. Test messages
    /// carry none.
    pub payload: Option<NotificationPayload>,
}

/// Why a retryable attempt failed. Drives the backoff constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The backend could not be reached (connect error, probe failure, timeout).
    Connectivity,
    /// The backend answered with a non-success status.
    Rejected,
}

/// What a backend said after accepting a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Acknowledgement {
    None,
    Ok,
    Json(Value),
    Unparsed(String),
}

impl Acknowledgement {
    /// Interpret a success body: JSON, the literal `OK`, or anything else.
    pub fn parse(body: &str) -> Self {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return Acknowledgement::None;
        }
        if trimmed.eq_ignore_ascii_case("ok") {
            return Acknowledgement::Ok;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(v) => Acknowledgement::Json(v),
            Err(_) => Acknowledgement::Unparsed(trimmed.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered(Acknowledgement),
    RetryableFailure { kind: FailureKind, reason: String },
    FatalFailure(String),
}

impl DeliveryOutcome {
    pub fn connectivity(reason: impl Into<String>) -> Self {
        DeliveryOutcome::RetryableFailure {
            kind: FailureKind::Connectivity,
            reason: reason.into(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        DeliveryOutcome::RetryableFailure {
            kind: FailureKind::Rejected,
            reason: reason.into(),
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered(_))
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn id(&self) -> BackendId;

    /// Deliver one message using the current configuration snapshot.
    async fn send(&self, message: &RenderedMessage, config: &Backends) -> DeliveryOutcome;
}

/// The four production backends in dispatch priority order.
pub fn default_backends(app: &App) -> Result<Vec<Arc<dyn Backend>>> {
    let http = http_client(app.request_timeout())?;
    Ok(vec![
        Arc::new(TemplatedBackend::with_client(http.clone())) as Arc<dyn Backend>,
        Arc::new(TransactionalBackend::with_client(http.clone())),
        Arc::new(VendorBackend),
        Arc::new(SandboxBackend::with_client(http).with_sender_name(app.app_name.clone())),
    ])
}

pub fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(concat!("specimen-notify/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
        .context("failed to build HTTP client")
}

fn log_request(backend: BackendId, request: &Request) {
    debug!(backend = %backend, method = %request.method(), url = %request.url(), "sending request");
    for (name, value) in request.headers() {
        if name.as_str().eq_ignore_ascii_case("authorization") {
            debug!("  {}: [REDACTED]", name);
        } else {
            debug!("  {}: {}", name, value.to_str().unwrap_or("[invalid]"));
        }
    }
}

/// Execute a prepared request. A 2xx yields the response body; anything else
/// is folded into a failure outcome.
pub(crate) async fn execute(
    http: &Client,
    backend: BackendId,
    request: Request,
) -> std::result::Result<String, DeliveryOutcome> {
    log_request(backend, &request);
    let res = match http.execute(request).await {
        Ok(res) => res,
        Err(err) => {
            warn!(backend = %backend, ?err, "request failed before a response");
            return Err(DeliveryOutcome::connectivity(format!(
                "{} unreachable: {}",
                backend, err
            )));
        }
    };

    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    if !status.is_success() {
        warn!(backend = %backend, %status, body = %body, "backend rejected message");
        return Err(DeliveryOutcome::rejected(format!(
            "{} error {}: {}",
            backend, status, body
        )));
    }
    debug!(backend = %backend, %status, body = %body, "backend accepted message");
    Ok(body)
}

/// Client and addresses for adapter tests that talk to a local HTTP server.
#[cfg(test)]
pub(crate) mod test_http {
    use reqwest::Client;
    use std::time::Duration;

    pub fn client() -> Client {
        Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    /// URL on a loopback port nothing listens on.
    pub fn refused_url(path: &str) -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{}{}", port, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;

    #[test]
    fn acknowledgement_parsing() {
        assert_eq!(Acknowledgement::parse("OK"), Acknowledgement::Ok);
        assert_eq!(Acknowledgement::parse("  ok\n"), Acknowledgement::Ok);
        assert_eq!(Acknowledgement::parse(""), Acknowledgement::None);
        assert_eq!(
            Acknowledgement::parse(r#"{"status":"sent"}"#),
            Acknowledgement::Json(json!({"status": "sent"}))
        );
        assert_eq!(
            Acknowledgement::parse("queued for delivery"),
            Acknowledgement::Unparsed("queued for delivery".into())
        );
    }

    #[test]
    fn outcome_helpers() {
        assert!(DeliveryOutcome::Delivered(Acknowledgement::None).is_delivered());
        assert_eq!(
            DeliveryOutcome::rejected("x"),
            DeliveryOutcome::RetryableFailure {
                kind: FailureKind::Rejected,
                reason: "x".into()
            }
        );
        assert!(!DeliveryOutcome::connectivity("y").is_delivered());
    }

    #[tokio::test]
    async fn execute_returns_body_on_success() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/send");
                then.status(200).body("OK");
            })
            .await;
        let http = test_http::client();
        let request = http.post(server.url("/send")).build().unwrap();
        let body = execute(&http, BackendId::Sandbox, request).await.unwrap();
        assert_eq!(body, "OK");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn execute_folds_failures_into_outcomes() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/send");
                then.status(503).body("maintenance");
            })
            .await;
        let http = test_http::client();

        let request = http.post(server.url("/send")).build().unwrap();
        match execute(&http, BackendId::Sandbox, request).await {
            Err(DeliveryOutcome::RetryableFailure { kind, reason }) => {
                assert_eq!(kind, FailureKind::Rejected);
                assert!(reason.contains("503"), "{reason}");
                assert!(reason.contains("maintenance"), "{reason}");
            }
            other => panic!("unexpected {other:?}"),
        }

        let request = http.post(test_http::refused_url("/send")).build().unwrap();
        match execute(&http, BackendId::Sandbox, request).await {
            Err(DeliveryOutcome::RetryableFailure { kind, .. }) => {
                assert_eq!(kind, FailureKind::Connectivity)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn default_backends_follow_priority() {
        let cfg: crate::config::Config = serde_yaml::from_str(crate::config::example()).unwrap();
        let backends = default_backends(&cfg.app).unwrap();
        let ids: Vec<_> = backends.iter().map(|b| b.id()).collect();
        assert_eq!(ids, BackendId::PRIORITY.to_vec());
    }
}
