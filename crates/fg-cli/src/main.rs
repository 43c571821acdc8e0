mod simulate;

use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use fg_config::{get_config, Config};
use fg_db::{Database, KeyRepository, RateMetricsRepository};
use fg_types::{redact, ApiKey, TenantKey};
use tracing::info;

#[derive(Parser)]
#[command(name = "fg", about = "Flowgate - LLM request governance", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage provider credentials
    Keys {
        #[command(subcommand)]
        action: KeyAction,
    },
    /// Summarize persisted request metrics
    Stats {
        #[arg(long)]
        provider: Option<String>,
        /// Look-back window in minutes
        #[arg(long, default_value_t = 60)]
        minutes: i64,
    },
    /// Delete persisted rate windows older than the given age
    Prune {
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
    /// Drive the governed pipeline against a simulated provider
    Simulate(simulate::SimulateArgs),
}

#[derive(Subcommand)]
enum KeyAction {
    /// Add or update a shared pool key
    Add {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        id: String,
        #[arg(long)]
        secret: String,
        /// Higher priority keys are picked proportionally more often
        #[arg(long, default_value_t = 0)]
        priority: u32,
    },
    /// List pool keys
    List {
        #[arg(long)]
        provider: Option<String>,
    },
    /// Take a pool key out of rotation
    Disable {
        #[arg(long)]
        id: String,
    },
    /// Set a tenant's dedicated key
    Tenant {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        provider: String,
        #[arg(long)]
        secret: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = get_config().context("Failed to load configuration")?;
    fg_core::init_logging(&config.logging).context("Failed to initialize logging")?;
    info!(project = %config.project_name, "Configuration loaded");

    match cli.command {
        Commands::Keys { action } => {
            let db = open_database(&config).await?;
            let result = run_keys(&db, action).await;
            db.close().await;
            result?
        }
        Commands::Stats { provider, minutes } => {
            let db = open_database(&config).await?;
            let result = print_stats(&db, provider.as_deref(), minutes).await;
            db.close().await;
            result?
        }
        Commands::Prune { hours } => {
            let db = open_database(&config).await?;
            let result = prune_metrics(&db, hours).await;
            db.close().await;
            result?
        }
        Commands::Simulate(args) => simulate::run(&config, args).await?,
    }
    Ok(())
}

async fn open_database(config: &Config) -> anyhow::Result<Arc<Database>> {
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
    }
    let db = Database::new(&config.db_path)
        .await
        .context("Failed to connect to database")?;
    db.initialize()
        .await
        .context("Failed to initialize database schema")?;
    Ok(Arc::new(db))
}

async fn run_keys(db: &Database, action: KeyAction) -> anyhow::Result<()> {
    let repo = KeyRepository::new(db);

    match action {
        KeyAction::Add {
            provider,
            id,
            secret,
            priority,
        } => {
            if secret.trim().is_empty() {
                bail!("Secret must not be empty");
            }
            repo.upsert_key(&ApiKey::new(&id, &provider, secret, priority))
                .await
                .context("Failed to save key")?;
            println!("Saved key {id} for {provider} (priority {priority})");
        }
        KeyAction::List { provider } => {
            let keys = repo
                .list_keys(provider.as_deref())
                .await
                .context("Failed to list keys")?;
            if keys.is_empty() {
                println!("No keys configured");
                return Ok(());
            }

            let now = Utc::now();
            println!(
                "{:<20} {:<12} {:>8} {:>7} {:>10} {:>8}  {:<10} cooldown",
                "id", "provider", "priority", "active", "today", "429s", "secret"
            );
            for k in keys {
                let cooldown = match k.cooldown_until {
                    Some(until) if until > now => format!("{}s", (until - now).num_seconds()),
                    _ => "-".to_string(),
                };
                println!(
                    "{:<20} {:<12} {:>8} {:>7} {:>10} {:>8}  {:<10} {}",
                    k.id,
                    k.provider,
                    k.priority,
                    if k.is_active { "yes" } else { "no" },
                    k.requests_today,
                    k.rate_limit_hits,
                    redact(&k.secret),
                    cooldown
                );
            }
        }
        KeyAction::Disable { id } => {
            if !repo.deactivate_key(&id).await.context("Failed to disable key")? {
                bail!("No key with id {id}");
            }
            println!("Disabled key {id}");
        }
        KeyAction::Tenant {
            tenant,
            provider,
            secret,
        } => {
            repo.upsert_tenant_key(&TenantKey {
                tenant_id: tenant.clone(),
                provider: provider.clone(),
                secret,
                cooldown_until: None,
            })
            .await
            .context("Failed to save tenant key")?;
            println!("Saved {provider} key for tenant {tenant}");
        }
    }
    Ok(())
}

async fn print_stats(db: &Database, provider: Option<&str>, minutes: i64) -> anyhow::Result<()> {
    if minutes <= 0 {
        bail!("--minutes must be positive");
    }
    let since = Utc::now() - Duration::minutes(minutes);
    let summaries = RateMetricsRepository::new(db)
        .summarize_since(provider, since)
        .await
        .context("Failed to read rate metrics")?;

    if summaries.is_empty() {
        println!("No requests recorded in the last {minutes} minutes");
        return Ok(());
    }

    println!(
        "{:<12} {:>9} {:>9} {:>7} {:>6} {:>9} {:>7} {:>7}",
        "provider", "requests", "success", "errors", "429s", "avg ms", "min ms", "max ms"
    );
    for s in summaries {
        println!(
            "{:<12} {:>9} {:>9} {:>7} {:>6} {:>9.1} {:>7} {:>7}",
            s.provider,
            s.requests,
            s.successes,
            s.errors,
            s.rate_limit_hits,
            s.avg_latency_ms,
            s.min_latency_ms.map_or("-".to_string(), |v| v.to_string()),
            s.max_latency_ms.map_or("-".to_string(), |v| v.to_string()),
        );
    }
    Ok(())
}

async fn prune_metrics(db: &Database, hours: i64) -> anyhow::Result<()> {
    if hours <= 0 {
        bail!("--hours must be positive");
    }
    let removed = RateMetricsRepository::new(db)
        .prune_before(Utc::now() - Duration::hours(hours))
        .await
        .context("Failed to prune rate metrics")?;
    info!(removed, hours, "Pruned rate windows");
    println!("Removed {removed} rate windows older than {hours}h");
    Ok(())
}
