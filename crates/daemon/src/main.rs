//! Automerger daemon entry point.
//!
//! Loads configuration, builds the review client and the mirror store,
//! starts the event listener and the dispatcher, and handles graceful
//! shutdown.

mod dispatcher;
mod server;
mod signals;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, Notify};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use automerger_core::config::ServiceConfig;
use automerger_core::review::gerrit::ConfigLocation;
use automerger_core::vcs::{CommitIdentity, GitStore, RemoteSource};
use automerger_core::{Automerger, GerritClient, ReviewEvent};

use crate::dispatcher::{DispatchStats, Dispatcher, Redelivery};
use crate::server::AppState;

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// Automerger event daemon.
#[derive(Parser, Debug)]
#[command(
    name = "automerger-daemon",
    version,
    about = "Propagates reviewed changes to downstream branches"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config =
        ServiceConfig::load_from_file(&args.config).context("failed to load configuration file")?;
    config
        .resolve_env_vars()
        .context("failed to resolve environment variables in config")?;
    config
        .validate()
        .context("configuration validation failed")?;

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .init();

    info!("========================================");
    info!("  Automerger Daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file   : {}", args.config.display());
    info!("Review URL    : {}", config.review.url);
    info!("Account       : {}", config.review.username);
    info!("Config source : {}:{}", config.review.config_project, config.review.config_ref);
    info!("Listen        : {}", config.daemon.listen);
    info!("Mirror dir    : {}", config.daemon.mirror_dir.display());
    info!("Log level     : {}", log_level);
    info!("========================================");

    std::fs::create_dir_all(&config.daemon.mirror_dir)
        .context("failed to create mirror directory")?;

    let password = config
        .review
        .password
        .clone()
        .context("review password was not resolved")?;
    let review = Arc::new(
        GerritClient::new(
            &config.review.url,
            &config.review.username,
            &password,
            ConfigLocation {
                project: config.review.config_project.clone(),
                refname: config.review.config_ref.clone(),
                file: config.review.config_file.clone(),
            },
        )
        .context("failed to create review client")?,
    );

    let store = Arc::new(GitStore::new(
        &config.daemon.mirror_dir,
        CommitIdentity {
            name: config.git.author_name.clone(),
            email: config.git.author_email.clone(),
        },
    ));

    let mut automerger = Automerger::new(review, store, config.propagation.clone())
        .with_account(&config.review.username);
    if config.review.fetch_before_merge {
        automerger = automerger.with_remote(RemoteSource {
            base_url: config.review.url.clone(),
            username: config.review.username.clone(),
            password,
        });
    }
    let automerger = Arc::new(automerger);

    // Surface a broken configuration document early; events still load it fresh.
    match automerger.load_config().await {
        Ok(Some(doc)) => info!(edges = doc.edges().len(), "automerger configuration loaded"),
        Ok(None) => warn!("no automerger configuration document found, propagation is disabled"),
        Err(e) => warn!(error = %e, "could not load automerger configuration"),
    }

    let (queue_tx, queue_rx) = mpsc::channel::<ReviewEvent>(config.daemon.queue_depth);
    let stats = Arc::new(DispatchStats::new());

    let state = Arc::new(AppState {
        queue: queue_tx,
        secret: config.daemon.event_secret.clone(),
        stats: stats.clone(),
    });
    if state.secret.is_none() {
        warn!("no event secret configured, accepting unsigned events");
    }

    let listen_addr = config.daemon.listen.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::serve(state, &listen_addr).await {
            error!("event listener error: {}", e);
        }
    });

    let shutdown = Arc::new(Notify::new());
    let mut dispatcher = Dispatcher::new(automerger, queue_rx, stats).with_redelivery(Redelivery {
        attempts: config.daemon.redelivery_attempts,
        backoff: std::time::Duration::from_millis(config.daemon.redelivery_backoff_ms),
    });
    let dispatcher_shutdown = shutdown.clone();
    let dispatcher_handle = tokio::spawn(async move {
        dispatcher.run(dispatcher_shutdown).await;
    });

    signals::wait_for_shutdown().await;
    info!("Shutdown signal received, stopping...");

    // Stop accepting events first, then let the dispatcher finish its event.
    server_handle.abort();
    shutdown.notify_one();

    match tokio::time::timeout(std::time::Duration::from_secs(30), dispatcher_handle).await {
        Ok(Ok(())) => info!("dispatcher stopped gracefully"),
        Ok(Err(e)) => warn!("dispatcher task error: {}", e),
        Err(_) => warn!("dispatcher did not stop within 30s, forcing shutdown"),
    }

    info!("Automerger daemon stopped.");
    Ok(())
}
