use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;

use super::{execute, http_client, Acknowledgement, Backend, DeliveryOutcome, RenderedMessage};
use crate::config::{Backends, Sandbox};
use crate::model::BackendId;

/// Sandbox delivery endpoint (captures mail into a test inbox).
#[derive(Clone)]
pub struct SandboxBackend {
    http: Client,
    sender_name: Option<String>,
}

impl fmt::Debug for SandboxBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxBackend").finish_non_exhaustive()
    }
}

impl SandboxBackend {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self::with_client(http_client(timeout)?))
    }

    pub fn with_client(http: Client) -> Self {
        Self {
            http,
            sender_name: None,
        }
    }

    /// Display name for the sender; without one only the address is sent.
    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = Some(name.into());
        self
    }

    pub fn build_request(&self, cfg: &Sandbox, message: &RenderedMessage) -> Result<reqwest::Request> {
        let endpoint = Url::parse(&cfg.api_url).context("invalid sandbox api_url")?;
        self.http
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", cfg.api_token))
            .header("Content-Type", "application/json")
            .json(&build_body(cfg, self.sender_name.as_deref(), message))
            .build()
            .context("failed to build sandbox request")
    }
}

pub fn build_body(cfg: &Sandbox, sender_name: Option<&str>, message: &RenderedMessage) -> Value {
    let mut from = json!({ "email": cfg.from_email });
    if let (Some(name), Some(map)) = (sender_name, from.as_object_mut()) {
        map.insert("name".into(), json!(name));
    }
    json!({
        "from": from,
        "to": [ { "email": message.recipient.address } ],
        "subject": message.subject,
        "text": message.text,
        "html": message.html,
    })
}

#[async_trait]
impl Backend for SandboxBackend {
    fn id(&self) -> BackendId {
        BackendId::Sandbox
    }

    async fn send(&self, message: &RenderedMessage, config: &Backends) -> DeliveryOutcome {
        let request = match self.build_request(&config.sandbox, message) {
            Ok(r) => r,
            Err(err) => return DeliveryOutcome::FatalFailure(format!("{:#}", err)),
        };
        match execute(&self.http, self.id(), request).await {
            Ok(body) => DeliveryOutcome::Delivered(Acknowledgement::parse(&body)),
            Err(outcome) => outcome,
        }
    }
}
