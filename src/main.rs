//! Pingwatch - ICMP host liveness monitor
//!
//! Probes a list of hosts, derives a debounced health color for each and
//! records color transitions in a persistent log.

mod config;
mod journal;
mod monitor;
mod probe;
mod targets;

use config::{AppConfig, MonitorConfig, SettingsWatcher};
use journal::{Journal, TransitionKind, SYSTEM_SUBJECT};
use monitor::{Registry, RetentionManager};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("pingwatch=info".parse()?))
        .init();

    // Load configuration
    let mut cfg = AppConfig::load();
    if let Some(path) = std::env::args().nth(1) {
        cfg.hosts_file = Some(path.into());
    }
    tracing::info!("Using settings at {}", cfg.settings_path.display());
    tracing::info!("Using transition log at {}", cfg.log_path.display());

    let settings = MonitorConfig::load_or_default(&cfg.settings_path);
    if !cfg.settings_path.exists() {
        if let Err(e) = settings.save(&cfg.settings_path) {
            tracing::warn!("Could not write default settings: {}", e);
        }
    }
    let mut watcher = SettingsWatcher::new(&cfg.settings_path);
    let refresh = settings.interval() / 2;
    let (config_tx, config_rx) = watch::channel(settings);

    // Open the transition log
    let journal = Journal::open(&cfg.log_path);
    tracing::info!(
        "{} has history for {} hosts",
        journal.path().display(),
        journal.host_names().len()
    );
    journal.append(SYSTEM_SUBJECT, TransitionKind::MonitorStarted);

    let registry = Arc::new(Registry::new(config_rx.clone(), journal.clone()));

    // Add configured targets
    if let Some(path) = &cfg.hosts_file {
        for target in targets::load_targets(path)? {
            let id = registry.add(&target.host_name, &target.address).await?;
            let mut lines = registry.subscribe(id).await?;
            let host_name = target.host_name.clone();
            tokio::spawn(async move {
                while let Ok(line) = lines.recv().await {
                    tracing::debug!(host = %host_name, "{}", line);
                }
            });
        }
    }

    // Start retention
    let retention = RetentionManager::new(journal.clone(), config_rx, Duration::from_secs(1));
    retention.start();

    let mut ticker = tokio::time::interval(refresh);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = ticker.tick() => {
                match watcher.poll() {
                    Some(Ok(settings)) => {
                        tracing::info!("Settings reloaded");
                        config_tx.send_replace(settings);
                    }
                    Some(Err(e)) => tracing::warn!("Ignoring invalid settings: {}", e),
                    None => {}
                }
                for snapshot in registry.snapshots().await {
                    match serde_json::to_string(&snapshot) {
                        Ok(line) => println!("{}", line),
                        Err(e) => tracing::warn!("Could not render snapshot {}: {}", snapshot.id, e),
                    }
                }
            }
        }
    }

    tracing::info!("Shutting down...");
    shut_down(&registry, &retention, &journal, cfg.hosts_file.as_deref()).await;

    Ok(())
}

/// Join every monitor, write the target list back and close the log.
/// Persistence failures are logged and never cut the sequence short.
async fn shut_down(
    registry: &Registry,
    retention: &RetentionManager,
    journal: &Journal,
    hosts_file: Option<&Path>,
) {
    let targets = registry.targets().await;
    registry.shutdown().await;
    retention.stop().await;

    if let Some(path) = hosts_file {
        if let Err(e) = targets::save_targets(path, &targets) {
            tracing::warn!("Could not export targets to {}: {}", path.display(), e);
        }
    }

    journal.append(SYSTEM_SUBJECT, TransitionKind::MonitorStopped);
    journal.flush_if_dirty();
}
