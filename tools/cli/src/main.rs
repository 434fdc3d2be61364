//! fitsync CLI - Command line interface for the sync engine.
//!
//! This tool keeps a local SQLite database in step with the remote API and
//! offers a few local writes to produce changes worth syncing.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fitsync_common::coerce::value_as_millis;
use fitsync_common::{
    now_millis, Client, ClientMeasurement, EntityFields, Record, RecordId, Table,
};
use fitsync_storage::{
    create_local, delete_local, FileKvStore, KeyValueStore, LocalStore, Predicate, SqliteStore,
    StoreTxn,
};
use fitsync_sync::{
    HttpTransport, SyncConfig, SyncCoordinator, SyncCursor, SyncMode, SyncOutcome,
    SyncScheduler,
};

#[derive(Parser)]
#[command(name = "fitsync")]
#[command(about = "fitsync - Offline-first sync for trainer data")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Remote API base URL (overrides the configuration).
    #[arg(long, global = true)]
    server: Option<String>,

    /// Bearer token (overrides the configuration).
    #[arg(long, global = true)]
    token: Option<String>,

    /// Local database path.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Keep the pull cursor in this JSON file instead of the database.
    #[arg(long, global = true)]
    cursor_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync (pull, then push).
    Sync {
        /// Ignore the minimum interval between runs.
        #[arg(short, long)]
        force: bool,
    },

    /// Sync periodically until interrupted.
    Watch {
        /// Seconds between runs (default: configured periodic interval).
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Show pending local changes and the pull cursor.
    Status,

    /// Forget the pull cursor; the next sync downloads everything.
    ResetCursor,

    /// Print the effective configuration.
    Config,

    /// Manage clients locally.
    Client {
        #[command(subcommand)]
        command: ClientCommands,
    },

    /// Record measurements locally.
    Measure {
        #[command(subcommand)]
        command: MeasureCommands,
    },
}

#[derive(Subcommand)]
enum ClientCommands {
    /// Add a client.
    Add {
        /// First name.
        #[arg(short, long)]
        first_name: String,

        /// Last name.
        #[arg(short, long, default_value = "")]
        last_name: String,

        /// Email address.
        #[arg(short, long)]
        email: Option<String>,

        /// Owning trainer id.
        #[arg(short, long)]
        trainer_id: Option<String>,
    },

    /// List clients.
    List,

    /// Delete a client.
    Remove {
        /// Client id.
        id: String,
    },
}

#[derive(Subcommand)]
enum MeasureCommands {
    /// Add a measurement.
    Add {
        /// Client id.
        #[arg(long)]
        client_id: String,

        /// Measurement type: "weight", "body_fat" or any custom metric.
        #[arg(short = 't', long = "type")]
        measurement_type: String,

        /// Measured value.
        #[arg(short, long)]
        value: f64,

        /// Unit ("kg", "lbs", "%", ...).
        #[arg(short, long, default_value = "kg")]
        unit: String,

        /// Measurement date (YYYY-MM-DD); defaults to now.
        #[arg(short, long)]
        date: Option<String>,

        /// Free-form notes.
        #[arg(short, long)]
        notes: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&cli)?;
    let db_path = match &cli.db {
        Some(path) => path.clone(),
        None => default_db_path()?,
    };
    let cursor_file = cli.cursor_file.as_deref();

    match cli.command {
        Commands::Sync { force } => cmd_sync(&db_path, cursor_file, &config, force).await,

        Commands::Watch { interval } => {
            cmd_watch(&db_path, cursor_file, &config, interval).await
        }

        Commands::Status => cmd_status(&db_path, cursor_file).await,

        Commands::ResetCursor => cmd_reset_cursor(&db_path, cursor_file).await,

        Commands::Config => cmd_config(&config),

        Commands::Client { command } => match command {
            ClientCommands::Add {
                first_name,
                last_name,
                email,
                trainer_id,
            } => cmd_client_add(&db_path, first_name, last_name, email, trainer_id).await,
            ClientCommands::List => cmd_client_list(&db_path).await,
            ClientCommands::Remove { id } => cmd_client_remove(&db_path, &id).await,
        },

        Commands::Measure { command } => match command {
            MeasureCommands::Add {
                client_id,
                measurement_type,
                value,
                unit,
                date,
                notes,
            } => {
                cmd_measure_add(
                    &db_path,
                    client_id,
                    measurement_type,
                    value,
                    unit,
                    date,
                    notes,
                )
                .await
            }
        },
    }
}

/// Configuration file (or defaults) with command line overrides applied.
fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SyncConfig::default(),
    };
    if let Some(server) = &cli.server {
        config = config.with_server_url(server.clone());
    }
    if let Some(token) = &cli.token {
        config = config.with_auth_token(token.clone());
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn default_db_path() -> Result<PathBuf> {
    let dir = dirs::data_dir()
        .context("Cannot determine the data directory, pass --db")?
        .join("fitsync");
    Ok(dir.join("fitsync.db"))
}

fn open_store(db_path: &Path) -> Result<SqliteStore> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    SqliteStore::open(db_path)
        .with_context(|| format!("Failed to open database {}", db_path.display()))
}

/// Where the pull cursor lives: the given file, or the database itself.
fn cursor_store(store: &SqliteStore, cursor_file: Option<&Path>) -> Arc<dyn KeyValueStore> {
    match cursor_file {
        Some(path) => Arc::new(FileKvStore::new(path)),
        None => Arc::new(store.clone()),
    }
}

fn build_coordinator(
    store: &SqliteStore,
    cursor_file: Option<&Path>,
    config: &SyncConfig,
) -> Result<Arc<SyncCoordinator>> {
    let transport = HttpTransport::new(config).context("Failed to create HTTP transport")?;
    Ok(Arc::new(SyncCoordinator::new(
        Arc::new(store.clone()),
        Arc::new(transport),
        cursor_store(store, cursor_file),
        config,
    )))
}

fn print_outcome(outcome: &SyncOutcome) -> Result<()> {
    match outcome {
        SyncOutcome::Completed(report) => {
            println!("Sync completed in {:?}", report.duration);
            for table in &report.inbound.tables {
                println!(
                    "  pulled {}: {} created, {} updated, {} deleted, {} reconciled, {} skipped",
                    table.table,
                    table.created,
                    table.updated,
                    table.deleted,
                    table.reconciled,
                    table.skipped
                );
            }
            println!(
                "  pushed {} changes, {} marked synced",
                report.pushed,
                report.outbound.marked()
            );
            for warning in &report.warnings {
                println!("  warning: {}", warning);
            }
            if let Some(cursor) = &report.cursor_after {
                println!("  cursor: {}", cursor);
            }
            Ok(())
        }
        SyncOutcome::Skipped(reason) => {
            println!("Sync skipped: {}", reason);
            Ok(())
        }
        SyncOutcome::Failed { phase, message } => {
            anyhow::bail!("Sync failed during {}: {}", phase, message)
        }
    }
}

/// Run a single sync.
async fn cmd_sync(
    db_path: &Path,
    cursor_file: Option<&Path>,
    config: &SyncConfig,
    force: bool,
) -> Result<()> {
    let store = open_store(db_path)?;
    let coordinator = build_coordinator(&store, cursor_file, config)?;
    info!("Syncing with {}", config.server_url);

    let outcome = if force {
        coordinator.force_sync().await
    } else {
        coordinator.sync().await
    };
    print_outcome(&outcome)
}

/// Sync periodically until Ctrl-C.
async fn cmd_watch(
    db_path: &Path,
    cursor_file: Option<&Path>,
    config: &SyncConfig,
    interval: Option<u64>,
) -> Result<()> {
    let store = open_store(db_path)?;
    let coordinator = build_coordinator(&store, cursor_file, config)?;

    let interval = match (interval, &config.sync_mode) {
        (Some(secs), _) => Duration::from_secs(secs),
        (None, SyncMode::Periodic { interval }) => *interval,
        (None, SyncMode::Manual) => Duration::from_secs(300),
    };
    if interval.is_zero() {
        anyhow::bail!("Interval must be positive");
    }

    let (scheduler, handle) = SyncScheduler::new(SyncMode::Periodic { interval });
    let mut status_rx = coordinator.subscribe();
    let task = tokio::spawn(handle.run_with(coordinator.clone()));
    println!(
        "Syncing with {} every {:?}, press Ctrl-C to stop",
        config.server_url, interval
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = status_rx.borrow_and_update().clone();
                info!("Sync state: {}", snapshot.state);
                if let Some(error) = &snapshot.last_error {
                    warn!("Last sync failed: {}", error);
                }
            }
        }
    }

    println!("Stopping...");
    scheduler.shutdown().await;
    task.await.context("Scheduler task failed")?;
    Ok(())
}

/// Show pending changes.
async fn cmd_status(db_path: &Path, cursor_file: Option<&Path>) -> Result<()> {
    let store = open_store(db_path)?;
    let cursor = SyncCursor::new(cursor_store(&store, cursor_file))
        .get()
        .await
        .context("Failed to read the sync cursor")?;

    println!("Database: {}", db_path.display());
    match cursor {
        Some(cursor) => println!("Last pulled: {}", cursor),
        None => println!("Last pulled: never"),
    }

    let mut txn = store.begin().await.context("Failed to open database")?;
    println!("Pending changes:");
    for table in Table::ALL {
        let dirty = txn.collection(table)?.query(&Predicate::Dirty)?;
        let count = |status: &str| {
            dirty
                .iter()
                .filter(|r| r.sync_status.as_str() == status)
                .count()
        };
        println!(
            "  {:<20} {} created, {} updated, {} deleted",
            table.as_str(),
            count("created"),
            count("updated"),
            count("deleted")
        );
    }
    Ok(())
}

/// Reset the pull cursor.
async fn cmd_reset_cursor(db_path: &Path, cursor_file: Option<&Path>) -> Result<()> {
    let store = open_store(db_path)?;
    SyncCursor::new(cursor_store(&store, cursor_file))
        .reset()
        .await
        .context("Failed to reset the sync cursor")?;
    println!("Cursor reset; the next sync downloads everything.");
    Ok(())
}

/// Print the effective configuration, without the token.
fn cmd_config(config: &SyncConfig) -> Result<()> {
    let mut shown = config.clone();
    if shown.auth_token.is_some() {
        shown.auth_token = Some("<redacted>".to_string());
    }
    println!("{}", serde_json::to_string_pretty(&shown)?);
    Ok(())
}

/// Add a client.
async fn cmd_client_add(
    db_path: &Path,
    first_name: String,
    last_name: String,
    email: Option<String>,
    trainer_id: Option<String>,
) -> Result<()> {
    let store = open_store(db_path)?;
    let record = create_local(
        &store,
        EntityFields::Clients(Client {
            trainer_id,
            first_name,
            last_name,
            email,
            active: true,
            ..Default::default()
        }),
    )
    .await
    .context("Failed to add client")?;

    println!("Client added: {}", record.id);
    Ok(())
}

fn format_millis(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ms.to_string())
}

/// List clients.
async fn cmd_client_list(db_path: &Path) -> Result<()> {
    let store = open_store(db_path)?;
    let mut txn: Box<dyn StoreTxn> = store.begin().await.context("Failed to open database")?;
    let clients: Vec<Record> = txn
        .collection(Table::Clients)?
        .query(&Predicate::All)?
        .into_iter()
        .filter(|r| r.deleted_at.is_none())
        .collect();

    if clients.is_empty() {
        println!("No clients.");
        return Ok(());
    }
    for record in clients {
        if let EntityFields::Clients(client) = &record.fields {
            println!(
                "  {}  {} {}  <{}>  [{}] updated {}",
                record.id,
                client.first_name,
                client.last_name,
                client.email.as_deref().unwrap_or("-"),
                record.sync_status.as_str(),
                format_millis(record.updated_at)
            );
        }
    }
    Ok(())
}

/// Delete a client.
async fn cmd_client_remove(db_path: &Path, id: &str) -> Result<()> {
    let store = open_store(db_path)?;
    let id = RecordId::new(id).context("Invalid client id")?;
    delete_local(&store, Table::Clients, &id)
        .await
        .with_context(|| format!("Failed to delete client {}", id))?;
    println!("Client {} deleted; the deletion is sent on the next sync.", id);
    Ok(())
}

/// Add a measurement.
async fn cmd_measure_add(
    db_path: &Path,
    client_id: String,
    measurement_type: String,
    value: f64,
    unit: String,
    date: Option<String>,
    notes: Option<String>,
) -> Result<()> {
    let measured_at = match date {
        Some(date) => value_as_millis(&serde_json::Value::String(date.clone()))
            .with_context(|| format!("Invalid date {}", date))?,
        None => now_millis(),
    };

    let store = open_store(db_path)?;
    let record = create_local(
        &store,
        EntityFields::ClientMeasurements(ClientMeasurement {
            client_id: Some(client_id),
            trainer_id: None,
            measurement_type,
            value,
            unit,
            measured_at,
            notes,
        }),
    )
    .await
    .context("Failed to add measurement")?;

    println!("Measurement added: {}", record.id);
    Ok(())
}
