use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use specimen_notify::config;
use specimen_notify::outbox::Outbox;
use specimen_notify::store::SqliteStore;

#[derive(Debug, Parser)]
#[command(about = "Inspect notifications kept in the local outbox")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print every kept notification, oldest first
    List {
        /// Print the full plain-text body of each entry
        #[arg(long)]
        body: bool,
        /// Emit the entries as a JSON array
        #[arg(long)]
        json: bool,
    },
    /// Delete every kept notification
    Clear,
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
    let store = SqliteStore::connect(&cfg.database_url())
        .await
        .context("failed to open outbox store")?;
    let outbox = Outbox::new(Arc::new(store));

    match args.command {
        Command::List { body, json } => {
            let entries = outbox.list_all().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
                return Ok(());
            }
            if entries.is_empty() {
                println!("outbox is empty");
            }
            for e in &entries {
                println!(
                    "{}  {}  {} <{}>  {}",
                    e.id,
                    e.timestamp.to_rfc3339(),
                    e.recipient_name,
                    e.recipient_address,
                    e.subject
                );
                if body {
                    println!("{}\n", e.text);
                }
            }
        }
        Command::Clear => {
            let count = outbox.len().await;
            outbox
                .clear_all()
                .await
                .context("failed to clear outbox")?;
            println!("cleared {} entries", count);
        }
    }
    Ok(())
}
