//! ktrigger-daemon: consumes build-trigger messages and dispatches builds.
//!
//! Loads a settings file (or `KTRIGGER_*` env vars), registers the jobs it
//! defines, connects to the broker and runs until SIGINT/SIGTERM. With
//! `--watch`, edits to the settings file re-sync jobs and re-apply the
//! connection section; the broker backend and dispatch target are fixed at
//! startup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use ktrigger::{
    ConnectionConfig, ConnectionManager, DaemonSettings, DispatchSettings, Dispatcher, LogDispatcher,
    SubscriberRegistry, TriggerError, WebhookDispatcher,
};
use ktrigger_core::config::load_dotenv;
use ktrigger_queue::build_connector;

// ── CLI ─────────────────────────────────────────────────────────────

/// Message-driven build dispatcher.
#[derive(Parser, Debug)]
#[command(name = "ktrigger-daemon", version, about)]
struct Cli {
    /// Path to the settings TOML file. Without it, settings come from the environment.
    #[arg(long, env = "KTRIGGER_CONFIG")]
    config: Option<PathBuf>,

    /// Re-apply the settings file when it changes on disk.
    #[arg(long, env = "KTRIGGER_WATCH", default_value_t = false)]
    watch: bool,

    /// Override the broker backend ("kafka" or "memory").
    #[arg(long, env = "KTRIGGER_BROKER_BACKEND")]
    broker: Option<String>,
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let cli = Cli::parse();

    let mut settings = load_settings(cli.config.as_deref())?;
    if let Some(broker) = &cli.broker {
        settings.broker = broker.clone();
    }

    let registry = SubscriberRegistry::new();
    settings.job_catalog().sync_registry(&registry);

    let dispatcher = build_dispatcher(&settings.dispatch)?;
    let connector = build_connector(&settings.broker, &settings.kafka).context("failed to select broker backend")?;
    info!(backend = connector.provider(), "broker backend selected");

    let manager = ConnectionManager::with_options(
        connector,
        registry.clone(),
        dispatcher,
        settings.runtime.manager_options(),
    );
    apply(&manager, settings.connection_config()).await;

    let (reload_tx, mut reload_rx) = mpsc::channel::<()>(1);
    let _watcher = match (&cli.config, cli.watch) {
        (Some(path), true) => Some(watch_settings(path, reload_tx)?),
        _ => None,
    };

    let status_every = settings.runtime.status_interval();
    let mut ticker = tokio::time::interval(status_every.unwrap_or(Duration::from_secs(60)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = os_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
            Some(()) = reload_rx.recv() => {
                // Coalesce the burst of events one save produces.
                tokio::time::sleep(Duration::from_millis(250)).await;
                while reload_rx.try_recv().is_ok() {}
                if let Some(path) = &cli.config {
                    reload(path, &manager, &registry).await;
                }
            }
            _ = ticker.tick(), if status_every.is_some() => {
                log_status(&manager, &registry).await;
            }
        }
    }

    let stop_timeout = settings.runtime.stop_timeout();
    match manager.shutdown_and_wait(stop_timeout).await {
        Ok(()) => info!("ktrigger-daemon exited cleanly"),
        Err(e) => warn!(error = %e, "consumer was force-released during shutdown"),
    }
    Ok(())
}

// ── helpers ─────────────────────────────────────────────────────────

fn load_settings(path: Option<&Path>) -> anyhow::Result<DaemonSettings> {
    match path {
        Some(path) => {
            let settings = DaemonSettings::from_file(path)
                .with_context(|| format!("failed to load settings from {}", path.display()))?;
            info!(path = %path.display(), jobs = settings.jobs.len(), "loaded settings");
            Ok(settings)
        }
        None => {
            info!("no settings file given, reading connection from environment");
            Ok(DaemonSettings::from_env())
        }
    }
}

fn build_dispatcher(settings: &DispatchSettings) -> anyhow::Result<Arc<dyn Dispatcher>> {
    match &settings.webhook_url {
        Some(url) => {
            let webhook = WebhookDispatcher::new(url.clone(), settings.timeout())?;
            info!(url = %url, "dispatching builds via webhook");
            Ok(Arc::new(webhook))
        }
        None => {
            info!("no webhook configured, dispatches are only logged");
            Ok(Arc::new(LogDispatcher))
        }
    }
}

async fn apply(manager: &ConnectionManager, config: ConnectionConfig) {
    match manager.apply_config(config).await {
        Ok(outcome) => info!(outcome = ?outcome, "connection config applied"),
        Err(TriggerError::Config(reason)) => {
            warn!(reason = %reason, "connection config incomplete, consumer left stopped")
        }
        Err(e) => warn!(error = %e, "failed to apply connection config"),
    }
}

async fn reload(path: &Path, manager: &ConnectionManager, registry: &SubscriberRegistry) {
    match DaemonSettings::from_file(path) {
        Ok(settings) => {
            info!(path = %path.display(), "settings changed, re-applying");
            settings.job_catalog().sync_registry(registry);
            apply(manager, settings.connection_config()).await;
        }
        Err(e) => warn!(
            path = %path.display(),
            error = %e,
            "failed to reload settings, keeping current configuration"
        ),
    }
}

async fn log_status(manager: &ConnectionManager, registry: &SubscriberRegistry) {
    let status = manager.status();
    let stats = status.stats.unwrap_or_default();
    let config = manager.current_config().await.redacted_summary();
    info!(
        state = %status.state,
        config = %config,
        topic = status.topic.as_deref().unwrap_or("-"),
        subscribers = registry.len(),
        received = stats.received,
        dispatched = stats.dispatched,
        last_error = status.last_error.as_deref().unwrap_or("-"),
        "consumer status"
    );
}

/// Watch the settings file's directory; editors often replace the file
/// rather than writing it in place.
fn watch_settings(path: &Path, reload_tx: mpsc::Sender<()>) -> anyhow::Result<RecommendedWatcher> {
    let file_name = path.file_name().map(|n| n.to_os_string());
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
        Ok(event) => {
            let touched = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                && event.paths.iter().any(|p| p.file_name() == file_name.as_deref());
            if touched {
                // A reload is already queued when the channel is full.
                let _ = reload_tx.try_send(());
            }
        }
        Err(e) => warn!(error = %e, "settings watcher error"),
    })
    .context("failed to create settings watcher")?;

    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", dir.display()))?;
    info!(path = %path.display(), "watching settings file for changes");
    Ok(watcher)
}

async fn os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
            }
            _ => {
                warn!("failed to register unix signal handlers, falling back to ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
