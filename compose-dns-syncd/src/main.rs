mod config;
mod error;
mod fsutil;
mod labels;
mod output;
mod reconcile;
mod state_store;
mod sync_manager;
mod triggers;

use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use crate::config::Config;
use crate::labels::compose::ComposeSource;
use crate::labels::extract::ExtractOptions;
use crate::state_store::StateStore;
use crate::sync_manager::{CycleOutcome, SyncHandle, SyncWorker, Trigger};
use crate::triggers::RunContext;

#[tokio::main]
async fn main() -> Result<()> {
    // Optional TOML config file, environment variables override it
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref()).with_context(|| match &config_path {
        Some(path) => format!("Failed to load config from {}", path.display()),
        None => "Failed to load config from environment".to_string(),
    })?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log.level)),
        )
        .init();

    tracing::info!("Starting compose-dns-syncd");

    let source = ComposeSource::new(
        &config.source.compose_file,
        ExtractOptions {
            process_traefik: config.source.process_traefik,
            default_host_ip: config.source.default_host_ip.clone(),
        },
    );
    tracing::info!(
        "Reading labels from {} (traefik rules: {})",
        source.path().display(),
        if config.source.process_traefik { "on" } else { "off" }
    );

    let worker = SyncWorker::new(
        Box::new(source),
        StateStore::new(&config.output.state_file),
        &config.output.output_file,
        config.output.retention,
    );

    // Start sync thread
    let sync = SyncHandle::spawn(worker);

    match sync.run_cycle(Trigger::Startup).await? {
        CycleOutcome::SourceUnavailable => tracing::warn!("Initial sync skipped, label source unavailable"),
        CycleOutcome::Unchanged => tracing::info!("Initial sync: output already up to date"),
        CycleOutcome::Applied { state_saved, output_written, report } => tracing::info!(
            "Initial sync: {} added, {} removed, {} conflicts (state saved: {}, output written: {})",
            report.added.len(),
            report.removed.len(),
            report.conflicts.len(),
            state_saved,
            output_written
        ),
    }

    if !config.triggers.watch_mode && !config.triggers.timed_mode {
        tracing::info!("Neither WATCH_MODE nor TIMED_MODE is enabled, exiting after one sync");
        sync.shutdown().await?;
        return Ok(());
    }

    // Create cancellation token for graceful shutdown
    let ctx = RunContext {
        config: Arc::new(config),
        cancel: CancellationToken::new(),
    };

    let mut handles = Vec::new();
    if ctx.config.triggers.timed_mode {
        handles.push(tokio::spawn(triggers::run_timer(ctx.clone(), sync.clone())));
    }
    if ctx.config.triggers.watch_mode {
        handles.push(tokio::spawn(triggers::run_watcher(ctx.clone(), sync.clone())));
    }

    wait_for_shutdown_signal().await?;

    ctx.cancel.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!("Trigger task failed: {}", e);
        }
    }

    // Lets an in-flight cycle finish first
    if let Err(e) = sync.shutdown().await {
        tracing::error!("Failed to shutdown sync thread: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolves on ctrl-c, or on SIGTERM where the platform has it (`docker stop`)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for ctrl-c")?,
            _ = terminate.recv() => tracing::info!("SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");
    Ok(())
}
