//! Dispatcher: picks the first eligible backend, drives it through a bounded
//! retry loop and falls back to the local outbox.
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{Backend, DeliveryOutcome, FailureKind, RenderedMessage};
use crate::compose::{self, Branding, ComposedMessage};
use crate::config::{Config, ConfigResolver, Retry};
use crate::model::{
    AttemptOutcome, BackendId, DeliveryAttempt, NotificationPayload, Recipient,
};
use crate::outbox::Outbox;

/// Waits between attempts.
#[async_trait]
pub trait Delay: Send + Sync {
    async fn wait(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioDelay;

#[async_trait]
impl Delay for TokioDelay {
    async fn wait(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub connectivity_backoff: Duration,
    pub rejection_backoff: Duration,
}

impl RetryPolicy {
    /// Wait before attempt `attempt + 1`: the base for the failure kind,
    /// scaled by the number of attempts made so far.
    pub fn backoff(&self, kind: FailureKind, attempt: u32) -> Duration {
        self.base(kind).saturating_mul(attempt.max(1))
    }

    /// Like [`backoff`](Self::backoff), but never shorter than or equal to
    /// `previous`: a kind with a smaller base is pushed one base step past
    /// the last wait. Zero bases stay zero.
    pub fn next_wait(&self, kind: FailureKind, attempt: u32, previous: Duration) -> Duration {
        let wait = self.backoff(kind, attempt);
        if wait > previous || self.base(kind).is_zero() {
            wait
        } else {
            previous.saturating_add(self.base(kind))
        }
    }

    fn base(&self, kind: FailureKind) -> Duration {
        match kind {
            FailureKind::Connectivity => self.connectivity_backoff,
            FailureKind::Rejected => self.rejection_backoff,
        }
    }
}

impl From<&Retry> for RetryPolicy {
    fn from(r: &Retry) -> Self {
        Self {
            max_attempts: r.max_attempts.max(1),
            connectivity_backoff: Duration::from_millis(r.connectivity_backoff_ms),
            rejection_backoff: Duration::from_millis(r.rejection_backoff_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&Retry::default())
    }
}

/// Why a message ended up in the outbox instead of on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveReason {
    Simulated,
    Development,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Delivered(BackendId),
    Saved(SaveReason),
    /// Simulate mode with local saving disabled.
    LoggedOnly,
    NoBackend,
    /// Nothing delivered and the outbox write failed too.
    Lost,
}

impl Disposition {
    /// The boolean surfaced to callers.
    pub fn is_handled(&self) -> bool {
        matches!(
            self,
            Disposition::Delivered(_) | Disposition::Saved(_) | Disposition::LoggedOnly
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub disposition: Disposition,
    pub attempts: Vec<DeliveryAttempt>,
}

pub struct Dispatcher {
    resolver: Arc<ConfigResolver>,
    backends: Vec<Arc<dyn Backend>>,
    outbox: Arc<Outbox>,
    delay: Arc<dyn Delay>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<BackendId> = self.backends.iter().map(|b| b.id()).collect();
        f.debug_struct("Dispatcher")
            .field("backends", &ids)
            .field("outbox", &self.outbox)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// `backends` are ordered by [`BackendId::PRIORITY`] whatever order they
    /// arrive in; only the first configured one is ever used for a message.
    pub fn new(
        resolver: Arc<ConfigResolver>,
        mut backends: Vec<Arc<dyn Backend>>,
        outbox: Arc<Outbox>,
    ) -> Self {
        backends.sort_by_key(|b| b.id().rank());
        let validation = resolver.validate();
        if !validation.is_valid() {
            warn!(errors = ?validation.errors, "notification delivery is not configured");
        } else {
            info!(eligible = ?validation.eligible, "notification backends ready");
        }
        Self {
            resolver,
            backends,
            outbox,
            delay: Arc::new(TokioDelay),
        }
    }

    pub fn with_delay(mut self, delay: Arc<dyn Delay>) -> Self {
        self.delay = delay;
        self
    }

    pub fn resolver(&self) -> &Arc<ConfigResolver> {
        &self.resolver
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// Notify a collection owner that someone suggested an identification.
    /// True when the message was delivered or kept locally.
    pub async fn notify_suggestion_created(
        &self,
        recipient_address: &str,
        recipient_name: &str,
        payload: &NotificationPayload,
    ) -> bool {
        let recipient = Recipient {
            address: recipient_address.to_string(),
            name: recipient_name.to_string(),
        };
        self.dispatch(recipient, payload)
            .await
            .disposition
            .is_handled()
    }

    #[instrument(skip_all, fields(collection = %payload.collection_name))]
    pub async fn dispatch(&self, recipient: Recipient, payload: &NotificationPayload) -> DispatchReport {
        let cfg = self.resolver.snapshot();
        let recipient = resolve_recipient(&cfg, recipient);
        let composed = compose::compose(payload, &Branding::from_app(&cfg.app));
        let mut attempts = Vec::new();

        if cfg.app.simulate {
            let disposition = if cfg.app.save_locally {
                self.save(&recipient, &composed, payload, SaveReason::Simulated)
                    .await
            } else {
                info!(
                    to = %recipient.address,
                    subject = %composed.subject,
                    "simulate mode: message not sent"
                );
                debug!(text = %composed.text, "simulated message body");
                Disposition::LoggedOnly
            };
            return DispatchReport {
                disposition,
                attempts,
            };
        }

        let Some(backend) = self.select(&cfg) else {
            let disposition = if cfg.app.development {
                info!("no backend configured; keeping message locally (development)");
                self.save(&recipient, &composed, payload, SaveReason::Development)
                    .await
            } else {
                warn!(to = %recipient.address, "no backend configured; notification not sent");
                Disposition::NoBackend
            };
            return DispatchReport {
                disposition,
                attempts,
            };
        };

        let message = rendered(recipient.clone(), &composed, Some(payload.clone()));
        let disposition = if self
            .attempt_delivery(backend.as_ref(), &message, &cfg, &mut attempts)
            .await
        {
            Disposition::Delivered(backend.id())
        } else {
            warn!(
                backend = %backend.id(),
                attempts = attempts.len(),
                "delivery failed; saving to outbox"
            );
            self.save(&recipient, &composed, payload, SaveReason::Exhausted)
                .await
        };
        DispatchReport {
            disposition,
            attempts,
        }
    }

    /// Send a fixed test message through the first configured backend.
    /// Failures are not kept in the outbox.
    #[instrument(skip_all, fields(to = %to.address))]
    pub async fn send_test_message(&self, to: Recipient) -> bool {
        let cfg = self.resolver.snapshot();
        let Some(backend) = self.select(&cfg) else {
            warn!("no backend configured; cannot send test message");
            return false;
        };
        let composed = compose::test_message(&Branding::from_app(&cfg.app));
        let message = rendered(to, &composed, None);
        let mut attempts = Vec::new();
        let delivered = self
            .attempt_delivery(backend.as_ref(), &message, &cfg, &mut attempts)
            .await;
        if delivered {
            info!(backend = %backend.id(), "test message delivered");
        } else {
            error!(backend = %backend.id(), attempts = attempts.len(), "test message failed");
        }
        delivered
    }

    fn select(&self, cfg: &Config) -> Option<Arc<dyn Backend>> {
        let selected = self
            .backends
            .iter()
            .find(|b| cfg.backends.is_configured(b.id()))
            .cloned();
        if let Some(b) = &selected {
            debug!(backend = %b.id(), "selected backend");
        }
        selected
    }

    async fn attempt_delivery(
        &self,
        backend: &dyn Backend,
        message: &RenderedMessage,
        cfg: &Config,
        attempts: &mut Vec<DeliveryAttempt>,
    ) -> bool {
        let id = backend.id();
        let policy = RetryPolicy::from(&cfg.app.retry);
        let timeout = cfg.app.request_timeout();
        let mut last_wait = Duration::ZERO;

        for attempt in 1..=policy.max_attempts {
            debug!(backend = %id, attempt, "delivery attempt");
            let outcome = match tokio::time::timeout(timeout, backend.send(message, &cfg.backends)).await {
                Ok(outcome) => outcome,
                Err(_) => DeliveryOutcome::connectivity(format!(
                    "{} timed out after {}s",
                    id,
                    timeout.as_secs()
                )),
            };

            match outcome {
                DeliveryOutcome::Delivered(ack) => {
                    info!(backend = %id, attempt, ack = ?ack, "notification delivered");
                    attempts.push(DeliveryAttempt {
                        backend: id,
                        attempt,
                        outcome: AttemptOutcome::Success,
                        detail: None,
                    });
                    return true;
                }
                DeliveryOutcome::FatalFailure(reason) => {
                    error!(backend = %id, attempt, %reason, "delivery failed permanently");
                    attempts.push(DeliveryAttempt {
                        backend: id,
                        attempt,
                        outcome: AttemptOutcome::FatalFailure,
                        detail: Some(reason),
                    });
                    return false;
                }
                DeliveryOutcome::RetryableFailure { kind, reason } => {
                    warn!(backend = %id, attempt, ?kind, %reason, "delivery attempt failed");
                    attempts.push(DeliveryAttempt {
                        backend: id,
                        attempt,
                        outcome: AttemptOutcome::RetryableFailure,
                        detail: Some(reason),
                    });
                    if attempt < policy.max_attempts {
                        let wait = policy.next_wait(kind, attempt, last_wait);
                        last_wait = wait;
                        debug!(backend = %id, wait_ms = wait.as_millis() as u64, "backing off");
                        self.delay.wait(wait).await;
                    }
                }
            }
        }
        false
    }

    async fn save(
        &self,
        recipient: &Recipient,
        composed: &ComposedMessage,
        payload: &NotificationPayload,
        reason: SaveReason,
    ) -> Disposition {
        let entry = self.outbox.new_entry(recipient, composed, payload);
        let id = entry.id.clone();
        match self.outbox.append(entry).await {
            Ok(()) => {
                info!(%id, ?reason, "notification kept in outbox");
                Disposition::Saved(reason)
            }
            Err(err) => {
                error!(%err, ?reason, "notification could not be kept in outbox");
                Disposition::Lost
            }
        }
    }
}

fn resolve_recipient(cfg: &Config, recipient: Recipient) -> Recipient {
    match &cfg.app.recipient_override {
        Some(over) => {
            debug!(requested = %recipient.address, to = %over.address, "recipient overridden");
            over.clone()
        }
        None => recipient,
    }
}

fn rendered(
    recipient: Recipient,
    composed: &ComposedMessage,
    payload: Option<NotificationPayload>,
) -> RenderedMessage {
    RenderedMessage {
        recipient,
        subject: composed.subject.clone(),
        text: composed.text.clone(),
        html: composed.html.clone(),
        payload,
    }
}
