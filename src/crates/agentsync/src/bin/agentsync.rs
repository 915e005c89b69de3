//! agentsync CLI
//!
//! Runs the sync hub and the store maintenance tasks.

use agentsync::atomic::{AtomicOperations, RestoreOptions};
use agentsync::config::{AgentSyncConfig, ConfigLoader, LoggingConfig};
use agentsync::migration::{DataMigration, LegacyJsonMigration, MigrationConfig};
use agentsync::repositories::EventRepository;
use agentsync::{
    Database, HealthChecker, HealthStatus, ShutdownCoordinator, StoreConfig, SyncHub, SyncManager,
};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agentsync")]
#[command(about = "agentsync - storage, sync and coordination for multi-agent orchestration", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Explicit config file, applied over the user and project layers
    #[arg(short, long, global = true, env = "AGENTSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Database file, overriding the configured one
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the sync hub
    Serve {
        /// Listen host, overriding the configured one
        #[arg(long)]
        host: Option<String>,
        /// Listen port, overriding the configured one
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print store statistics
    Stats,

    /// Check store health
    Health {
        /// Output format: text (default), json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Import the legacy JSON data layout
    MigrateLegacy {
        /// Root of the legacy data
        #[arg(long)]
        data_dir: PathBuf,
        /// Read and transform without writing
        #[arg(long)]
        dry_run: bool,
        /// Overwrite records that already exist
        #[arg(long)]
        force: bool,
        /// Log every migrated item
        #[arg(short, long)]
        verbose: bool,
    },

    /// Snapshot the store
    Backup {
        /// Description; described backups are never pruned
        #[arg(short, long)]
        description: Option<String>,
    },

    /// Replace the store with a snapshot
    Restore {
        /// Snapshot file
        path: PathBuf,
        /// Validate without restoring
        #[arg(long)]
        dry_run: bool,
        /// Skip the pre-restore backup
        #[arg(long)]
        no_backup: bool,
        /// Restore even if the snapshot's schema is newer
        #[arg(long)]
        skip_version_check: bool,
    },

    /// Prune old automatic backups
    CleanupBackups {
        /// Keep automatic backups younger than this many days
        #[arg(long)]
        retention_days: Option<i64>,
        /// Keep at most this many recent automatic backups
        #[arg(long)]
        max_backups: Option<usize>,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match logging.format.as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
}

async fn open_store(config: &AgentSyncConfig, database: Option<PathBuf>) -> anyhow::Result<Arc<Database>> {
    let store = match database {
        Some(path) => StoreConfig::file(path).read_only(config.database.read_only),
        None => StoreConfig::from_config(config),
    };
    Ok(Arc::new(Database::open(store).await?))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_explicit_path(path);
    }
    let config = loader.load().await?;
    init_tracing(&config.logging);

    let db = open_store(&config, cli.database).await?;
    let backup_dir = config.backup_dir();

    let outcome = run(cli.command, &config, db.clone(), backup_dir).await;
    db.close().await;
    outcome
}

async fn run(
    command: Commands,
    config: &AgentSyncConfig,
    db: Arc<Database>,
    backup_dir: PathBuf,
) -> anyhow::Result<()> {
    match command {
        Commands::Serve { host, port } => {
            let mut hub_config = config.hub.clone();
            if let Some(host) = host {
                hub_config.host = host;
            }
            if let Some(port) = port {
                hub_config.port = port;
            }

            let shutdown = ShutdownCoordinator::new();
            let _signals = shutdown.install_signal_handlers();

            let hub = Arc::new(SyncHub::start(hub_config, db.clone()).await?);
            let manager = Arc::new(SyncManager::new(db.clone()).with_hub(hub.clone()));
            let listener = manager.start();
            println!("Sync hub listening on {}", hub.url());

            shutdown.wait_for_shutdown().await;
            hub.stop().await;
            if let Some(listener) = listener {
                listener.abort();
            }
            info!("Sync hub stopped");
            Ok(())
        }

        Commands::Stats => {
            let store = db.stats().await?;
            let mut conn = db.acquire().await?;
            let events = EventRepository::count(&mut conn).await?;
            drop(conn);
            let backups = AtomicOperations::new(db, backup_dir).backup_history().await?;
            print_json(&json!({
                "store": store,
                "events": events,
                "backups": backups.len(),
            }))
        }

        Commands::Health { format } => {
            let report = HealthChecker::check_all(&db, config, &backup_dir, None).await;

            if format == "json" {
                return print_json(&report);
            }

            println!("Overall Status: {}", match report.status {
                HealthStatus::Healthy => "✓ Healthy",
                HealthStatus::Degraded => "⚠ Degraded",
                HealthStatus::Unhealthy => "✗ Unhealthy",
            });
            println!("Total Response Time: {}ms", report.total_response_time_ms);
            println!();
            println!("{:<16} {:<12} {:<10} Message", "Component", "Status", "Time (ms)");
            println!("{}", "-".repeat(72));
            for check in &report.checks {
                println!(
                    "{:<16} {:<12} {:<10} {}",
                    check.name,
                    check.status.to_string(),
                    check.response_time_ms,
                    check.message.as_deref().unwrap_or("N/A")
                );
            }

            if report.status == HealthStatus::Unhealthy {
                anyhow::bail!("store is unhealthy");
            }
            Ok(())
        }

        Commands::MigrateLegacy {
            data_dir,
            dry_run,
            force,
            verbose,
        } => {
            let migration_config = MigrationConfig::new(data_dir, backup_dir.join("legacy"))
                .dry_run(dry_run)
                .force(force)
                .verbose(verbose);
            let mut migration = LegacyJsonMigration::new(db, migration_config);
            migration.on_progress(|progress| {
                info!(
                    phase = ?progress.phase,
                    current = progress.current,
                    total = progress.total,
                    percentage = progress.percentage,
                    "Migration progress"
                );
            });

            let report = migration.migrate().await?;
            print_json(&report)?;
            if !report.success {
                anyhow::bail!("{} item(s) failed to migrate", report.errors.len());
            }
            Ok(())
        }

        Commands::Backup { description } => {
            let atomic = AtomicOperations::new(db, backup_dir);
            let backup = atomic.create_backup(description.as_deref()).await?;
            print_json(&backup)
        }

        Commands::Restore {
            path,
            dry_run,
            no_backup,
            skip_version_check,
        } => {
            let atomic = AtomicOperations::new(db, backup_dir);
            let options = RestoreOptions {
                create_backup_before_restore: !no_backup,
                skip_version_check,
                dry_run,
                ..RestoreOptions::default()
            };
            let outcome = atomic.restore_from_backup(&path, options).await?;
            print_json(&outcome)?;
            if !outcome.success {
                anyhow::bail!("restored store failed its integrity check");
            }
            Ok(())
        }

        Commands::CleanupBackups {
            retention_days,
            max_backups,
        } => {
            let atomic = AtomicOperations::new(db, backup_dir);
            let removed = atomic
                .cleanup_old_backups(
                    retention_days.unwrap_or(config.backup.retention_days),
                    max_backups.unwrap_or(config.backup.max_backups),
                )
                .await?;
            print_json(&json!({ "removed": removed }))
        }
    }
}
