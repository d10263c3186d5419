//! Operator CLI for twinstore.
//!
//! Works directly against the configured replicas and the coordination
//! store, so it reads the same configuration file as `twinsyncd`.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::process::ExitCode;
use std::sync::Arc;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use twinstore_core::config::AppConfig;
use twinstore_core::{Notification, ObjectKey, ObjectKind, ObjectRef, ReplicaId};
use twinstore_metadata::MetadataStore;
use twinstore_metadata::models::{DEAD_LETTER_PARKED, DEAD_LETTER_PENDING, from_micros};
use twinstore_sync::{InboundEvent, ReplicaSet, StoreEvent, SyncEngine, VerificationReport};
use uuid::Uuid;

/// Exit status for a run that found drift.
const EXIT_MISMATCH: u8 = 1;
/// Exit status for a run that could not complete.
const EXIT_ERROR: u8 = 2;

#[derive(Parser)]
#[command(name = "twinctl")]
#[command(about = "Operator CLI for twinstore replication")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ConfigArgs {
    /// Path to configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "TWINSTORE_CONFIG",
        default_value = "config/twinstore.toml"
    )]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare objects on a source replica against every other replica
    Verify {
        /// Object kind to verify
        #[arg(long, value_enum)]
        kind: KindArg,
        /// Only objects created after this time (RFC 3339). Defaults to the stored checkpoint.
        #[arg(long, value_parser = parse_rfc3339)]
        since: Option<OffsetDateTime>,
        /// Replica to enumerate (default: the first configured replica)
        #[arg(long)]
        source: Option<String>,
        /// Report only; never advance the checkpoint
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Print the report as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Enqueue a sync task by hand
    Submit {
        /// Object kind
        #[arg(long, value_enum)]
        kind: KindArg,
        /// Object key within its kind (a content hash or `{uuid}.{version}`)
        #[arg(long)]
        key: String,
        /// Replica holding the object (default: the first configured replica)
        #[arg(long)]
        source: Option<String>,
        /// Copy to this replica only (default: every other replica)
        #[arg(long)]
        dest: Option<String>,
        /// Object size in bytes, if known
        #[arg(long)]
        size: Option<u64>,
    },
    /// Dead-letter management commands
    DeadLetter {
        #[command(subcommand)]
        command: DeadLetterCommands,
    },
    /// Verification checkpoint commands
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
}

#[derive(Subcommand)]
enum DeadLetterCommands {
    /// List dead letters, oldest first
    List {
        /// Only letters in this state
        #[arg(long, value_enum)]
        state: Option<StateArg>,
        /// Maximum number of letters to show
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
    /// Re-enqueue a dead letter with a fresh attempt budget
    Redrive {
        /// Dead letter ID
        id: Uuid,
    },
}

#[derive(Subcommand)]
enum CheckpointCommands {
    /// Show the verification checkpoint of every kind
    Show,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Blob,
    File,
    Bundle,
    Collection,
}

impl From<KindArg> for ObjectKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Blob => ObjectKind::Blob,
            KindArg::File => ObjectKind::FileManifest,
            KindArg::Bundle => ObjectKind::BundleManifest,
            KindArg::Collection => ObjectKind::CollectionManifest,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum StateArg {
    Pending,
    Parked,
}

impl StateArg {
    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => DEAD_LETTER_PENDING,
            Self::Parked => DEAD_LETTER_PARKED,
        }
    }
}

fn parse_rfc3339(s: &str) -> Result<OffsetDateTime, String> {
    OffsetDateTime::parse(s, &Rfc3339).map_err(|e| format!("invalid RFC 3339 time {s:?}: {e}"))
}

fn format_time(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| at.to_string())
}

/// Load configuration from an optional TOML file overlaid with `TWINSTORE_` env vars.
fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if std::path::Path::new(path).exists() {
        figment = figment.merge(Toml::file(path));
    } else {
        let has_env_config = std::env::vars()
            .any(|(key, _)| key.starts_with("TWINSTORE_") && key != "TWINSTORE_CONFIG");
        if !has_env_config {
            anyhow::bail!(
                "config file not found: {path}\n\
                 Pass --config or set TWINSTORE_CONFIG. See config/twinstore.example.toml."
            );
        }
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("TWINSTORE_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

/// Resolve `--source`, defaulting to the first configured replica.
fn source_replica(config: &AppConfig, source: Option<String>) -> Result<ReplicaId> {
    match source {
        Some(name) => {
            config
                .replica(&name)
                .with_context(|| format!("unknown replica: {name}"))?;
            Ok(ReplicaId::new(name))
        }
        None => config
            .replicas
            .first()
            .map(|r| ReplicaId::new(&r.name))
            .context("no replicas configured"),
    }
}

async fn open_metadata(config: &AppConfig) -> Result<Arc<dyn MetadataStore>> {
    twinstore_metadata::from_config(&config.metadata)
        .await
        .with_context(|| {
            format!(
                "failed to open coordination store at {}",
                config.metadata.path.display()
            )
        })
}

async fn open_replicas(config: &AppConfig) -> Result<ReplicaSet> {
    ReplicaSet::from_config(&config.replicas)
        .await
        .context("failed to initialize replica stores")
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so reports on stdout stay machine-readable.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let Cli { config, command } = Cli::parse();

    match run(&config.config, command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}

async fn run(config_path: &str, command: Commands) -> Result<ExitCode> {
    let config = load_config(config_path)?;

    match command {
        Commands::Verify {
            kind,
            since,
            source,
            dry_run,
            json,
        } => handle_verify(&config, kind.into(), since, source, dry_run, json).await,
        Commands::Submit {
            kind,
            key,
            source,
            dest,
            size,
        } => {
            handle_submit(&config, kind.into(), &key, source, dest, size).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::DeadLetter { command } => {
            handle_dead_letter_command(&config, command).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Checkpoint { command } => {
            handle_checkpoint_command(&config, command).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn handle_verify(
    config: &AppConfig,
    kind: ObjectKind,
    since: Option<OffsetDateTime>,
    source: Option<String>,
    dry_run: bool,
    json: bool,
) -> Result<ExitCode> {
    let source = source_replica(config, source)?;
    let replicas = open_replicas(config).await?;
    let metadata = open_metadata(config).await?;
    let engine = SyncEngine::new(&config.sync, replicas, metadata.clone());

    let report = engine
        .verifier(config.verify.page_size, &config.sync)
        .verify_and_checkpoint(metadata.as_ref(), kind, &source, since, dry_run)
        .await
        .context("verification failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, dry_run);
    }

    if report.is_clean() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_MISMATCH))
    }
}

fn print_report(report: &VerificationReport, dry_run: bool) {
    println!("Kind: {}", report.kind);
    println!("Source: {}", report.source);
    println!(
        "Since: {}",
        report
            .since
            .map(format_time)
            .unwrap_or_else(|| "beginning".to_string())
    );
    println!("Verified: {}", report.verified);

    if report.mismatches.is_empty() {
        println!("Mismatches: none");
    } else {
        println!("Mismatches: {}", report.mismatches.len());
        println!("\n{:<14} {:<14} {:<76} Detail", "Replica", "Problem", "Key");
        println!("{}", "-".repeat(120));
        for m in &report.mismatches {
            println!(
                "{:<14} {:<14} {:<76} {}",
                m.replica,
                m.kind.to_string(),
                m.key,
                m.detail.as_deref().unwrap_or("-")
            );
        }
        println!();
    }

    if report.checkpoint_advanced {
        if let Some(at) = report.new_checkpoint {
            println!("Checkpoint advanced to {}", format_time(at));
        }
    } else if dry_run {
        println!("Checkpoint unchanged (dry run)");
    } else {
        println!("Checkpoint unchanged");
    }
}

async fn handle_submit(
    config: &AppConfig,
    kind: ObjectKind,
    key: &str,
    source: Option<String>,
    dest: Option<String>,
    size: Option<u64>,
) -> Result<()> {
    let key = ObjectKey::new(key).context("invalid object key")?;
    key.validate_for(kind).context("invalid object key")?;
    let object = ObjectRef::new(kind, key);
    let source = source_replica(config, source)?;

    let event = match dest {
        Some(dest) => InboundEvent::Forwarded(Notification {
            source_replica: source.to_string(),
            source_key: object.storage_key(),
            dest_replica: dest,
            dest_key: None,
            object_kind: Some(kind),
            size,
        }),
        None => InboundEvent::Store(StoreEvent {
            replica: source.to_string(),
            key: object.storage_key(),
            size,
        }),
    };

    let replicas = open_replicas(config).await?;
    let metadata = open_metadata(config).await?;
    let engine = SyncEngine::new(&config.sync, replicas, metadata);

    let tasks = event.into_tasks(&engine.replicas)?;
    for task in tasks {
        let item_id = engine.submit(task.clone()).await?;
        println!(
            "Queued {} -> {}: task {} (item {})",
            task.source, task.destination, task.task_id, item_id
        );
    }
    Ok(())
}

async fn handle_dead_letter_command(config: &AppConfig, command: DeadLetterCommands) -> Result<()> {
    let metadata = open_metadata(config).await?;

    match command {
        DeadLetterCommands::List { state, limit } => {
            let rows = metadata
                .list_dead_letters(state.map(StateArg::as_str), limit)
                .await?;

            if rows.is_empty() {
                println!("No dead letters found.");
                return Ok(());
            }

            println!(
                "{:<38} {:<8} {:<18} {:<9} {:<12} {:<12} {:<76} Reason",
                "ID", "State", "Class", "Attempts", "Source", "Destination", "Object"
            );
            println!("{}", "-".repeat(200));
            for row in rows {
                let (source, destination, object) = match row.task() {
                    Ok(task) => (
                        task.source.to_string(),
                        task.destination.to_string(),
                        task.source_ref().storage_key(),
                    ),
                    Err(_) => ("-".to_string(), "-".to_string(), "-".to_string()),
                };
                println!(
                    "{:<38} {:<8} {:<18} {:<9} {:<12} {:<12} {:<76} {}",
                    row.dead_letter_id,
                    row.state,
                    row.failure_class,
                    row.attempts,
                    source,
                    destination,
                    object,
                    row.reason
                );
            }
        }
        DeadLetterCommands::Redrive { id } => {
            match twinstore_sync::dead_letter::redrive(
                metadata.as_ref(),
                id,
                OffsetDateTime::now_utc(),
            )
            .await?
            {
                Some(task) => {
                    println!("Dead letter redriven.");
                    println!("\nTask ID: {}", task.task_id);
                    println!("Object: {}", task.source_ref().storage_key());
                    println!("Route: {} -> {}", task.source, task.destination);
                }
                None => anyhow::bail!("dead letter not found: {id}"),
            }
        }
    }
    Ok(())
}

async fn handle_checkpoint_command(config: &AppConfig, command: CheckpointCommands) -> Result<()> {
    let metadata = open_metadata(config).await?;

    match command {
        CheckpointCommands::Show => {
            let rows = metadata.list_checkpoints().await?;
            if rows.is_empty() {
                println!("No checkpoints recorded.");
                return Ok(());
            }

            println!("{:<12} {:<36} Updated", "Kind", "Checkpoint");
            println!("{}", "-".repeat(84));
            for row in rows {
                println!(
                    "{:<12} {:<36} {}",
                    row.kind,
                    format_time(row.checkpoint()?),
                    format_time(from_micros(row.updated_at)?)
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_since_accepts_rfc3339() {
        let at = parse_rfc3339("2025-03-01T12:00:00Z").unwrap();
        assert_eq!(at.unix_timestamp(), 1_740_830_400);
        assert!(parse_rfc3339("yesterday").is_err());
    }

    #[test]
    fn kind_arg_maps_to_object_kind() {
        assert_eq!(ObjectKind::from(KindArg::Blob), ObjectKind::Blob);
        assert_eq!(ObjectKind::from(KindArg::File), ObjectKind::FileManifest);
        assert_eq!(
            ObjectKind::from(KindArg::Collection),
            ObjectKind::CollectionManifest
        );
    }

    #[test]
    fn cli_parses_nested_commands() {
        let cli = Cli::try_parse_from([
            "twinctl",
            "--config",
            "x.toml",
            "dead-letter",
            "list",
            "--state",
            "parked",
        ])
        .unwrap();
        assert_eq!(cli.config.config, "x.toml");
        assert!(matches!(
            cli.command,
            Commands::DeadLetter {
                command: DeadLetterCommands::List {
                    state: Some(StateArg::Parked),
                    limit: 100
                }
            }
        ));
    }
}
