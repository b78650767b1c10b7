//! Configuration loader, validator and runtime resolver for the notification
//! dispatcher.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;

use crate::model::{BackendId, Recipient};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

pub const TEMPLATED_API_URL: &str = "https://api.emailjs.com/api/v1.0/email/send";
pub const TRANSACTIONAL_API_URL: &str = "https://api.sendgrid.com/v3/mail/send";
pub const SANDBOX_API_URL: &str = "https://send.api.mailtrap.io/api/send";

// Values shipped in example configs. A field equal to one of these is treated
// as not filled in.
const SERVICE_ID_PLACEHOLDERS: &[&str] = &["your_service_id", "service_abc123", "test_service_id"];
const TEMPLATE_ID_PLACEHOLDERS: &[&str] =
    &["your_template_id", "template_xyz789", "test_template_id"];
const USER_ID_PLACEHOLDERS: &[&str] = &["your_user_id", "user_def456", "test_user_id"];
const TRANSACTIONAL_KEY_PLACEHOLDERS: &[&str] = &["your_sendgrid_api_key", "your_api_key"];
const VENDOR_KEY_PLACEHOLDERS: &[&str] = &["your_gmail_api_key", "your_api_key"];
const SANDBOX_TOKEN_PLACEHOLDERS: &[&str] = &["your_mailtrap_api_token", "your_api_token"];
const SENDER_PLACEHOLDERS: &[&str] = &["your_email@example.com", "noreply@example.com"];

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub backends: Backends,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default)]
    pub support_email: String,
    /// Development mode: an undeliverable message with no eligible backend is
    /// still saved to the outbox.
    #[serde(default)]
    pub development: bool,
    /// Skip every backend and write straight to the outbox.
    #[serde(default)]
    pub simulate: bool,
    /// Whether simulate mode persists messages (otherwise they are only logged).
    #[serde(default = "default_true")]
    pub save_locally: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Deliver every notification here instead of to the collection owner.
    #[serde(default)]
    pub recipient_override: Option<Recipient>,
    #[serde(default)]
    pub retry: Retry,
}

/// Bounded retry policy applied to the selected backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Retry {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base wait after a transport-level failure (unreachable, timeout).
    #[serde(default = "default_connectivity_backoff_ms")]
    pub connectivity_backoff_ms: u64,
    /// Base wait after the backend answered with a failure status.
    #[serde(default = "default_rejection_backoff_ms")]
    pub rejection_backoff_ms: u64,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            connectivity_backoff_ms: default_connectivity_backoff_ms(),
            rejection_backoff_ms: default_rejection_backoff_ms(),
        }
    }
}

fn default_app_name() -> String {
    "SugFlora".to_string()
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_connectivity_backoff_ms() -> u64 {
    2000
}

fn default_rejection_backoff_ms() -> u64 {
    3000
}

/// Credentials for every backend. Sections left out of the YAML fall back to
/// placeholders, which makes the backend ineligible.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Backends {
    #[serde(default)]
    pub templated: Templated,
    #[serde(default)]
    pub transactional: Transactional,
    #[serde(default)]
    pub vendor: Vendor,
    #[serde(default)]
    pub sandbox: Sandbox,
}

/// Template-rendering email service (service/template/user identifiers).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Templated {
    pub service_id: String,
    pub template_id: String,
    pub user_id: String,
    #[serde(default = "default_templated_url")]
    pub api_url: String,
    /// Send an OPTIONS request before each POST.
    #[serde(default = "default_true")]
    pub probe: bool,
}

impl Default for Templated {
    fn default() -> Self {
        Self {
            service_id: SERVICE_ID_PLACEHOLDERS[0].into(),
            template_id: TEMPLATE_ID_PLACEHOLDERS[0].into(),
            user_id: USER_ID_PLACEHOLDERS[0].into(),
            api_url: default_templated_url(),
            probe: true,
        }
    }
}

/// Transactional mail API authorized by a bearer API key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transactional {
    pub api_key: String,
    pub from_email: String,
    #[serde(default = "default_app_name")]
    pub from_name: String,
    #[serde(default = "default_transactional_url")]
    pub api_url: String,
}

impl Default for Transactional {
    fn default() -> Self {
        Self {
            api_key: TRANSACTIONAL_KEY_PLACEHOLDERS[0].into(),
            from_email: "noreply@sugflora.com".into(),
            from_name: default_app_name(),
            api_url: default_transactional_url(),
        }
    }
}

/// Vendor API that needs a server-side integration; delivery is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vendor {
    pub api_key: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
}

impl Default for Vendor {
    fn default() -> Self {
        Self {
            api_key: VENDOR_KEY_PLACEHOLDERS[0].into(),
            client_id: String::new(),
            client_secret: String::new(),
        }
    }
}

/// Sandbox delivery endpoint for development inboxes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sandbox {
    pub api_token: String,
    pub from_email: String,
    #[serde(default = "default_sandbox_url")]
    pub api_url: String,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self {
            api_token: SANDBOX_TOKEN_PLACEHOLDERS[0].into(),
            from_email: "noreply@sugflora.com".into(),
            api_url: default_sandbox_url(),
        }
    }
}

fn default_templated_url() -> String {
    TEMPLATED_API_URL.to_string()
}

fn default_transactional_url() -> String {
    TRANSACTIONAL_API_URL.to_string()
}

fn default_sandbox_url() -> String {
    SANDBOX_API_URL.to_string()
}

fn is_real(value: &str, placeholders: &[&str]) -> bool {
    let value = value.trim();
    !value.is_empty() && !placeholders.contains(&value)
}

impl Backends {
    /// True iff every required field of the backend is non-empty and none of
    /// them equals a known placeholder.
    pub fn is_configured(&self, id: BackendId) -> bool {
        match id {
            BackendId::Templated => {
                let t = &self.templated;
                is_real(&t.service_id, SERVICE_ID_PLACEHOLDERS)
                    && is_real(&t.template_id, TEMPLATE_ID_PLACEHOLDERS)
                    && is_real(&t.user_id, USER_ID_PLACEHOLDERS)
                    && is_real(&t.api_url, &[])
            }
            BackendId::Transactional => {
                let t = &self.transactional;
                is_real(&t.api_key, TRANSACTIONAL_KEY_PLACEHOLDERS)
                    && is_real(&t.from_email, SENDER_PLACEHOLDERS)
                    && is_real(&t.api_url, &[])
            }
            BackendId::Vendor => is_real(&self.vendor.api_key, VENDOR_KEY_PLACEHOLDERS),
            BackendId::Sandbox => {
                let s = &self.sandbox;
                is_real(&s.api_token, SANDBOX_TOKEN_PLACEHOLDERS)
                    && is_real(&s.from_email, SENDER_PLACEHOLDERS)
                    && is_real(&s.api_url, &[])
            }
        }
    }
}

impl App {
    /// `data_dir` with a leading `~/` expanded against `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// SQLite URL for the outbox store; `DATABASE_URL` wins when set.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/outbox.db", self.app.resolved_data_dir()))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance. Placeholder credentials are not an
/// error here: they only make a backend ineligible.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.app_name.trim().is_empty() {
        return Err(ConfigError::Invalid("app.app_name must be non-empty"));
    }
    if cfg.app.request_timeout_secs == 0 {
        return Err(ConfigError::Invalid("app.request_timeout_secs must be > 0"));
    }
    if cfg.app.retry.max_attempts == 0 {
        return Err(ConfigError::Invalid("app.retry.max_attempts must be > 0"));
    }
    if let Some(r) = &cfg.app.recipient_override {
        if r.address.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "app.recipient_override.address must be non-empty",
            ));
        }
    }
    Ok(())
}

/// Outcome of [`ConfigResolver::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub eligible: Vec<BackendId>,
    pub errors: Vec<String>,
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Shared, runtime-updatable view of the configuration. Eligibility is
/// computed from the current snapshot on every call.
#[derive(Debug)]
pub struct ConfigResolver {
    inner: RwLock<Config>,
}

impl ConfigResolver {
    pub fn new(cfg: Config) -> Self {
        Self {
            inner: RwLock::new(cfg),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Config> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Config> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Config {
        self.read().clone()
    }

    pub fn is_configured(&self, id: BackendId) -> bool {
        self.read().backends.is_configured(id)
    }

    /// Configured backends in priority order.
    pub fn eligible(&self) -> Vec<BackendId> {
        let cfg = self.read();
        BackendId::PRIORITY
            .into_iter()
            .filter(|id| cfg.backends.is_configured(*id))
            .collect()
    }

    pub fn validate(&self) -> Validation {
        let eligible = self.eligible();
        let mut errors = Vec::new();
        if eligible.is_empty() {
            errors.push("no messaging backend is configured".to_string());
            errors.push(
                "fill in credentials for one of: templated, transactional, vendor, sandbox"
                    .to_string(),
            );
        }
        Validation { eligible, errors }
    }

    pub fn set_templated(&self, service_id: &str, template_id: &str, user_id: &str) {
        let mut cfg = self.write();
        cfg.backends.templated.service_id = service_id.to_string();
        cfg.backends.templated.template_id = template_id.to_string();
        cfg.backends.templated.user_id = user_id.to_string();
    }

    pub fn set_transactional(&self, api_key: &str, from_email: &str, from_name: &str) {
        let mut cfg = self.write();
        cfg.backends.transactional.api_key = api_key.to_string();
        cfg.backends.transactional.from_email = from_email.to_string();
        cfg.backends.transactional.from_name = from_name.to_string();
    }

    pub fn set_vendor(&self, api_key: &str) {
        self.write().backends.vendor.api_key = api_key.to_string();
    }

    pub fn set_sandbox(&self, api_token: &str, from_email: &str) {
        let mut cfg = self.write();
        cfg.backends.sandbox.api_token = api_token.to_string();
        cfg.backends.sandbox.from_email = from_email.to_string();
    }

    pub fn set_simulate(&self, simulate: bool) {
        self.write().app.simulate = simulate;
    }

    pub fn set_development(&self, development: bool) {
        self.write().app.development = development;
    }

    pub fn set_recipient_override(&self, recipient: Option<Recipient>) {
        self.write().app.recipient_override = recipient;
    }
}

/// Example configuration; every backend carries placeholder credentials.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  app_name: "SugFlora"
  support_email: "suporte@sugflora.com"
  development: false
  simulate: false
  save_locally: true
  request_timeout_secs: 30
  retry:
    max_attempts: 3
    connectivity_backoff_ms: 2000
    rejection_backoff_ms: 3000

backends:
  templated:
    service_id: "your_service_id"
    template_id: "your_template_id"
    user_id: "your_user_id"
    api_url: "https://api.emailjs.com/api/v1.0/email/send"
    probe: true
  transactional:
    api_key: "your_sendgrid_api_key"
    from_email: "noreply@sugflora.com"
    from_name: "SugFlora"
  vendor:
    api_key: "your_gmail_api_key"
    client_id: "your_gmail_client_id"
    client_secret: "your_gmail_client_secret"
  sandbox:
    api_token: "your_mailtrap_api_token"
    from_email: "noreply@sugflora.com"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_cfg() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_cfg();
        validate(&cfg).unwrap();
        assert_eq!(cfg.app.retry, Retry::default());
        assert_eq!(cfg.backends.templated.api_url, TEMPLATED_API_URL);
    }

    #[test]
    fn missing_sections_use_defaults() {
        let cfg: Config = serde_yaml::from_str("app:\n  data_dir: \"./d\"\n").unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.app.app_name, "SugFlora");
        assert!(cfg.app.save_locally);
        assert!(!cfg.app.simulate);
        assert_eq!(cfg.app.request_timeout_secs, 30);
        assert_eq!(cfg.backends, Backends::default());
    }

    #[test]
    fn invalid_app_settings() {
        let mut cfg = example_cfg();
        cfg.app.data_dir = " ".into();
        match validate(&cfg).unwrap_err() {
            ConfigError::Invalid(msg) => assert!(msg.contains("data_dir")),
            _ => panic!("wrong error"),
        }

        let mut cfg = example_cfg();
        cfg.app.retry.max_attempts = 0;
        match validate(&cfg).unwrap_err() {
            ConfigError::Invalid(msg) => assert!(msg.contains("max_attempts")),
            _ => panic!("wrong error"),
        }

        let mut cfg = example_cfg();
        cfg.app.request_timeout_secs = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.app.recipient_override = Some(Recipient {
            address: "".into(),
            name: "Someone".into(),
        });
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn placeholders_are_not_configured() {
        let cfg = example_cfg();
        for id in BackendId::PRIORITY {
            assert!(!cfg.backends.is_configured(id), "{id} should be ineligible");
        }
    }

    #[test]
    fn every_known_sentinel_is_rejected() {
        let mut backends = Backends::default();
        backends.templated.template_id = "tpl_real".into();
        backends.templated.user_id = "user_real".into();
        for sentinel in SERVICE_ID_PLACEHOLDERS {
            backends.templated.service_id = sentinel.to_string();
            assert!(!backends.is_configured(BackendId::Templated));
        }
        backends.templated.service_id = "  ".into();
        assert!(!backends.is_configured(BackendId::Templated));
        backends.templated.service_id = "service_real".into();
        assert!(backends.is_configured(BackendId::Templated));
    }

    #[test]
    fn single_field_flip_makes_backend_eligible() {
        let mut backends = Backends::default();
        assert!(!backends.is_configured(BackendId::Vendor));
        backends.vendor.api_key = "AIza-real-key".into();
        assert!(backends.is_configured(BackendId::Vendor));

        assert!(!backends.is_configured(BackendId::Transactional));
        backends.transactional.api_key = "SG.real".into();
        assert!(backends.is_configured(BackendId::Transactional));

        assert!(!backends.is_configured(BackendId::Sandbox));
        backends.sandbox.api_token = "token-real".into();
        assert!(backends.is_configured(BackendId::Sandbox));
        backends.sandbox.from_email = "".into();
        assert!(!backends.is_configured(BackendId::Sandbox));
    }

    #[test]
    fn resolver_reflects_runtime_setters() {
        let resolver = ConfigResolver::new(example_cfg());
        assert!(resolver.eligible().is_empty());
        assert!(!resolver.validate().is_valid());

        resolver.set_sandbox("token-real", "lab@example.org");
        resolver.set_templated("service_real", "template_real", "user_real");
        assert_eq!(
            resolver.eligible(),
            vec![BackendId::Templated, BackendId::Sandbox]
        );
        assert!(resolver.validate().is_valid());

        resolver.set_templated("your_service_id", "template_real", "user_real");
        assert!(!resolver.is_configured(BackendId::Templated));

        resolver.set_simulate(true);
        assert!(resolver.snapshot().app.simulate);
    }

    #[test]
    fn data_dir_expands_home() {
        let mut cfg = example_cfg();
        cfg.app.data_dir = "~/notify".into();
        if let Ok(home) = std::env::var("HOME") {
            assert_eq!(
                cfg.app.resolved_data_dir(),
                format!("{}/notify", home.trim_end_matches('/'))
            );
        }
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = example_cfg();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.backends.transactional.from_name, "SugFlora");
        assert!(cfg.backends.templated.probe);
    }
}
