//! tabguid CLI
//!
//! Inspect and administer the persisted tab identity snapshot.
//!
//! # Commands
//!
//! - `show`: print the persisted records
//! - `lookup`: print the guid held by a volatile tab id
//! - `reset`: delete the persisted snapshot
//! - `config`: print the effective configuration

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tabguid_core::config::{LogFormat, RegistryConfig};
use tabguid_core::logging::{LogError, init_logging};
use tabguid_core::persist::Snapshot;
use tabguid_core::store::open_store;
use tabguid_core::{Error, TabId};

/// Durable tab identity registry tools
#[derive(Parser)]
#[command(name = "tg")]
#[command(version = tabguid_core::VERSION)]
#[command(about = "Inspect and administer persisted tab identities")]
#[command(propagate_version = true)]
struct Cli {
    /// Config file (defaults to $XDG_CONFIG_HOME/tabguid/tabguid.toml)
    #[arg(long, global = true, env = "TABGUID_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter, overrides the config file
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format (pretty or json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the persisted records
    Show {
        /// Emit the raw snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the guid of the persisted tab holding a volatile id
    Lookup {
        /// Host tab id
        tab_id: i64,
    },
    /// Delete the persisted snapshot
    Reset {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            if let Some(remediation) = err
                .downcast_ref::<Error>()
                .and_then(Error::remediation)
            {
                eprintln!("\n{}", remediation.render_plain());
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config =
        RegistryConfig::load_or_default(cli.config.as_deref()).map_err(Error::from)?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    match init_logging(&config.logging) {
        Ok(()) | Err(LogError::AlreadyInitialized) => {}
        Err(e) => return Err(e).context("failed to initialize logging"),
    }

    match cli.command {
        Commands::Show { json } => show(&config, json).await,
        Commands::Lookup { tab_id } => lookup(&config, TabId(tab_id)).await,
        Commands::Reset { yes } => reset(&config, yes).await,
        Commands::Config => {
            print!("{}", config.to_toml().map_err(Error::from)?);
            Ok(())
        }
    }
}

async fn load_snapshot(config: &RegistryConfig) -> anyhow::Result<Option<Snapshot>> {
    let store = open_store(&config.store).map_err(Error::from)?;
    let Some(blob) = store
        .load(&config.storage_key)
        .await
        .map_err(Error::from)?
    else {
        return Ok(None);
    };
    let snapshot = Snapshot::from_json(&blob).map_err(Error::from)?;
    tracing::debug!(
        key = %config.storage_key,
        records = snapshot.records.len(),
        "snapshot read"
    );
    Ok(Some(snapshot))
}

async fn show(config: &RegistryConfig, json: bool) -> anyhow::Result<()> {
    let snapshot = load_snapshot(config).await?;

    if json {
        let snapshot = snapshot.unwrap_or_else(|| Snapshot::new(Vec::new()));
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let Some(snapshot) = snapshot else {
        println!("no snapshot stored under key {}", config.storage_key);
        return Ok(());
    };
    println!(
        "{} record(s) under key {} (schema {}, saved_at {})",
        snapshot.records.len(),
        config.storage_key,
        snapshot.schema_version,
        snapshot.saved_at
    );
    for record in &snapshot.records {
        println!(
            "{}  tab={}  index={}  attributes={}",
            record.guid,
            record.tab_id,
            record.index,
            record.attributes.len()
        );
    }
    Ok(())
}

async fn lookup(config: &RegistryConfig, tab_id: TabId) -> anyhow::Result<()> {
    let snapshot = load_snapshot(config).await?;
    let record = snapshot
        .iter()
        .flat_map(|s| s.records.iter())
        .find(|record| record.tab_id == tab_id);
    match record {
        Some(record) => {
            println!("{}", record.guid);
            Ok(())
        }
        None => bail!("no persisted tab holds id {tab_id}"),
    }
}

async fn reset(config: &RegistryConfig, yes: bool) -> anyhow::Result<()> {
    if !yes {
        bail!(
            "refusing to delete the snapshot under key {} without --yes",
            config.storage_key
        );
    }
    let store = open_store(&config.store).map_err(Error::from)?;
    store
        .clear(&config.storage_key)
        .await
        .map_err(Error::from)?;
    tracing::info!(key = %config.storage_key, "snapshot deleted");
    println!("snapshot {} deleted", config.storage_key);
    Ok(())
}
