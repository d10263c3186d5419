//! twinsyncd binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use twinstore_core::config::AppConfig;
use twinstore_server::{AppState, create_router};
use twinstore_sync::{ReplicaSet, SyncEngine};

/// twinsyncd - keeps twinstore replicas in sync
#[derive(Parser, Debug)]
#[command(name = "twinsyncd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "TWINSTORE_CONFIG",
        default_value = "config/twinstore.toml"
    )]
    config: String,
}

/// Load configuration from an optional TOML file overlaid with `TWINSTORE_` env vars.
fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    let has_config_file = std::path::Path::new(path).exists();

    if has_config_file {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path);
    }

    let has_env_config = std::env::vars()
        .any(|(key, _)| key.starts_with("TWINSTORE_") && key != "TWINSTORE_CONFIG");
    if !has_config_file && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: twinsyncd --config /path/to/twinstore.toml\n  \
             2. Environment variables, e.g. TWINSTORE_METADATA__PATH=/var/lib/twinstore/sync.db\n\n\
             See config/twinstore.example.toml for an example configuration."
        );
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

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("twinsyncd v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    twinstore_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let replicas = ReplicaSet::from_config(&config.replicas)
        .await
        .context("failed to initialize replica stores")?;
    // Fail fast on unreachable stores rather than reporting healthy.
    for id in replicas.ids() {
        replicas
            .get(id)?
            .health_check()
            .await
            .with_context(|| format!("health check failed for replica {id}"))?;
    }
    tracing::info!(replicas = replicas.len(), "Replica stores verified");

    let metadata = twinstore_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    tracing::info!(path = %config.metadata.path.display(), "Metadata store initialized");

    let engine = SyncEngine::new(&config.sync, replicas, metadata);
    let shutdown = CancellationToken::new();
    let background = engine.spawn(shutdown.clone());
    tracing::info!(
        workers = config.sync.worker_concurrency,
        "Sync workers and reaper started"
    );

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    let app = create_router(AppState::new(config, engine));

    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown requested");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    for handle in background {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Background task ended abnormally");
        }
    }
    tracing::info!("twinsyncd stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_config_from_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("twinstore.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[[replicas]]
name = "east"
storage = {{ type = "memory" }}

[[replicas]]
name = "west"
storage = {{ type = "memory" }}

[metadata]
path = "{}"

[sync]
part_size = 8388608
"#,
            temp.path().join("sync.db").display()
        )
        .unwrap();

        let config = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.replicas.len(), 2);
        assert_eq!(config.sync.part_size, 8 * 1024 * 1024);
        assert_eq!(config.sync.max_task_attempts, 10);
    }

    #[test]
    fn load_config_rejects_single_replica() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("twinstore.toml");
        std::fs::write(
            &path,
            "[[replicas]]\nname = \"only\"\nstorage = { type = \"memory\" }\n",
        )
        .unwrap();

        let err = load_config(path.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("invalid configuration"));
    }
}
