use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;

use super::{execute, http_client, Acknowledgement, Backend, DeliveryOutcome, RenderedMessage};
use crate::config::{Backends, Transactional};
use crate::model::BackendId;

/// Transactional mail API: sender identity, recipient, subject and both
/// content parts, authorized with a bearer API key.
#[derive(Clone)]
pub struct TransactionalBackend {
    http: Client,
}

impl fmt::Debug for TransactionalBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionalBackend").finish_non_exhaustive()
    }
}

impl TransactionalBackend {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self::with_client(http_client(timeout)?))
    }

    pub fn with_client(http: Client) -> Self {
        Self { http }
    }

    pub fn build_request(
        &self,
        cfg: &Transactional,
        message: &RenderedMessage,
    ) -> Result<reqwest::Request> {
        let endpoint = Url::parse(&cfg.api_url).context("invalid transactional api_url")?;
        self.http
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", cfg.api_key))
            .header("Content-Type", "application/json")
            .json(&build_body(cfg, message))
            .build()
            .context("failed to build transactional request")
    }
}

pub fn build_body(cfg: &Transactional, message: &RenderedMessage) -> Value {
    json!({
        "personalizations": [
            { "to": [ { "email": message.recipient.address, "name": message.recipient.name } ] }
        ],
        "from": { "email": cfg.from_email, "name": cfg.from_name },
        "subject": message.subject,
        "content": [
            { "type": "text/plain", "value": message.text },
            { "type": "text/html", "value": message.html },
        ],
    })
}

#[async_trait]
impl Backend for TransactionalBackend {
    fn id(&self) -> BackendId {
        BackendId::Transactional
    }

    async fn send(&self, message: &RenderedMessage, config: &Backends) -> DeliveryOutcome {
        let request = match self.build_request(&config.transactional, message) {
            Ok(r) => r,
            Err(err) => return DeliveryOutcome::FatalFailure(format!("{:#}", err)),
        };
        match execute(&self.http, self.id(), request).await {
            Ok(body) => DeliveryOutcome::Delivered(Acknowledgement::parse(&body)),
            Err(outcome) => outcome,
        }
    }
}
