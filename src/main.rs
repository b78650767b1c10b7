use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use specimen_notify::backend::default_backends;
use specimen_notify::config::{self, Config, ConfigResolver};
use specimen_notify::dispatcher::Dispatcher;
use specimen_notify::model::{NotificationPayload, Recipient};
use specimen_notify::outbox::Outbox;
use specimen_notify::store::SqliteStore;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Notify a collection owner about a new identification suggestion
    Notify {
        /// JSON file holding the suggestion payload
        #[arg(long)]
        payload: PathBuf,
        /// Collection owner's email address
        #[arg(long)]
        to: String,
        /// Collection owner's display name
        #[arg(long, default_value = "")]
        name: String,
    },
    /// Report which messaging backends are configured
    Check,
    /// Send a test message through the first configured backend
    TestSend {
        #[arg(long)]
        to: String,
        #[arg(long, default_value = "")]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;
    let resolver = Arc::new(ConfigResolver::new(cfg.clone()));

    match args.command {
        Command::Check => {
            let report = resolver.validate();
            for id in &report.eligible {
                println!("configured: {}", id);
            }
            for err in &report.errors {
                println!("error: {}", err);
            }
            if !report.is_valid() {
                bail!("messaging configuration is incomplete");
            }
        }
        Command::Notify { payload, to, name } => {
            let raw = tokio::fs::read_to_string(&payload)
                .await
                .with_context(|| format!("failed to read {}", payload.display()))?;
            let payload: NotificationPayload =
                serde_json::from_str(&raw).context("invalid notification payload")?;
            let dispatcher = build_dispatcher(&cfg, resolver).await?;
            let report = dispatcher
                .dispatch(Recipient { address: to, name }, &payload)
                .await;
            info!(disposition = ?report.disposition, attempts = report.attempts.len(), "dispatch finished");
            if !report.disposition.is_handled() {
                bail!("notification was neither delivered nor saved");
            }
        }
        Command::TestSend { to, name } => {
            let dispatcher = build_dispatcher(&cfg, resolver).await?;
            if !dispatcher
                .send_test_message(Recipient { address: to, name })
                .await
            {
                warn!("test message was not delivered");
                bail!("test message failed");
            }
        }
    }
    Ok(())
}

async fn build_dispatcher(cfg: &Config, resolver: Arc<ConfigResolver>) -> Result<Dispatcher> {
    let store = SqliteStore::connect(&cfg.database_url())
        .await
        .context("failed to open outbox store")?;
    let outbox = Arc::new(Outbox::new(Arc::new(store)));
    Ok(Dispatcher::new(resolver, default_backends(&cfg.app)?, outbox))
}
