use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{execute, http_client, Acknowledgement, Backend, DeliveryOutcome, RenderedMessage};
use crate::config::{Backends, Templated};
use crate::model::BackendId;

/// Template-rendering email service. The service fills its own template from
/// flattened parameters, so the composed bodies travel only as extra fields.
#[derive(Clone)]
pub struct TemplatedBackend {
    http: Client,
}

impl fmt::Debug for TemplatedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplatedBackend").finish_non_exhaustive()
    }
}

impl TemplatedBackend {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self::with_client(http_client(timeout)?))
    }

    pub fn with_client(http: Client) -> Self {
        Self { http }
    }

    pub fn build_request(&self, cfg: &Templated, message: &RenderedMessage) -> Result<reqwest::Request> {
        let endpoint = Url::parse(&cfg.api_url).context("invalid templated api_url")?;
        self.http
            .post(endpoint)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .json(&build_body(cfg, message))
            .build()
            .context("failed to build templated request")
    }

    pub fn build_probe(&self, cfg: &Templated) -> Result<reqwest::Request> {
        let endpoint = Url::parse(&cfg.api_url).context("invalid templated api_url")?;
        self.http
            .request(Method::OPTIONS, endpoint)
            .header("Content-Type", "application/json")
            .build()
            .context("failed to build templated probe")
    }

    /// Connectivity check before the real POST. Any HTTP answer counts as
    /// reachable.
    async fn probe(&self, cfg: &Templated) -> std::result::Result<(), DeliveryOutcome> {
        let request = self
            .build_probe(cfg)
            .map_err(|err| DeliveryOutcome::FatalFailure(format!("{:#}", err)))?;
        match self.http.execute(request).await {
            Ok(res) => {
                debug!(status = %res.status(), "templated probe answered");
                Ok(())
            }
            Err(err) => {
                warn!(?err, "templated probe failed");
                Err(DeliveryOutcome::connectivity(format!(
                    "templated probe failed: {}",
                    err
                )))
            }
        }
    }
}

/// JSON envelope: service/template/user identifiers plus template parameters.
pub fn build_body(cfg: &Templated, message: &RenderedMessage) -> Value {
    json!({
        "service_id": cfg.service_id,
        "template_id": cfg.template_id,
        "user_id": cfg.user_id,
        "template_params": template_params(message),
    })
}

fn template_params(message: &RenderedMessage) -> Value {
    let mut params = json!({
        "to_email": message.recipient.address,
        "to_name": message.recipient.name,
        "subject": message.subject,
        "message": message.text,
        "message_html": message.html,
    });
    if let (Some(p), Some(map)) = (&message.payload, params.as_object_mut()) {
        let opt = |v: &Option<String>| Value::String(v.clone().unwrap_or_default());
        map.insert("collection_name".into(), json!(p.collection_name));
        map.insert("collection_date".into(), json!(p.collection_date));
        map.insert("suggester_name".into(), json!(p.suggester_name));
        map.insert("suggester_email".into(), json!(p.suggester_address));
        map.insert("family".into(), opt(&p.suggested_family));
        map.insert("genus".into(), opt(&p.suggested_genus));
        map.insert("species".into(), opt(&p.suggested_species));
        map.insert("common_name".into(), opt(&p.suggested_common_name));
        map.insert("justification".into(), json!(p.justification));
        map.insert("confidence".into(), json!(p.confidence.unwrap_or(0)));
        map.insert("notes".into(), opt(&p.additional_notes));
    }
    params
}

#[async_trait]
impl Backend for TemplatedBackend {
    fn id(&self) -> BackendId {
        BackendId::Templated
    }

    async fn send(&self, message: &RenderedMessage, config: &Backends) -> DeliveryOutcome {
        let cfg = &config.templated;
        if cfg.probe {
            if let Err(outcome) = self.probe(cfg).await {
                return outcome;
            }
        }

        let request = match self.build_request(cfg, message) {
            Ok(r) => r,
            Err(err) => return DeliveryOutcome::FatalFailure(format!("{:#}", err)),
        };
        match execute(&self.http, self.id(), request).await {
            Ok(body) => {
                let ack = Acknowledgement::parse(&body);
                if let Acknowledgement::Unparsed(text) = &ack {
                    info!(response = %text, "templated backend accepted with unrecognised acknowledgement");
                }
                DeliveryOutcome::Delivered(ack)
            }
            Err(outcome) => outcome,
        }
    }
}
