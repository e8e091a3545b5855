//! Retention manager: periodic eviction and checkpointing of the transition log.

use chrono::Local;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::MonitorConfig;
use crate::journal::Journal;

/// Manager for dropping expired log entries and flushing the log to disk.
pub struct RetentionManager {
    journal: Journal,
    config: watch::Receiver<MonitorConfig>,
    period: Duration,
    stop: Mutex<Option<broadcast::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RetentionManager {
    pub fn new(journal: Journal, config: watch::Receiver<MonitorConfig>, period: Duration) -> Self {
        Self {
            journal,
            config,
            period,
            stop: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Start the retention manager background task.
    pub fn start(&self) {
        let journal = self.journal.clone();
        let config = self.config.clone();
        let (tx, mut rx) = broadcast::channel(1);
        let mut interval = tokio::time::interval(self.period);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        process_retention(&journal, &config);
                    }
                }
            }
        });

        *self.stop.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    /// Stop the background task and run one last eviction and flush.
    pub async fn stop(&self) {
        if let Some(tx) = self.stop.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = tx.send(());
        }
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("RetentionManager: task failed: {}", e);
            }
        }
        process_retention(&self.journal, &self.config);
    }
}

fn process_retention(journal: &Journal, config: &watch::Receiver<MonitorConfig>) {
    let retention_hours = config.borrow().log_retention_hours;
    let removed = journal.evict_expired(retention_hours, Local::now().naive_local());
    if removed > 0 {
        tracing::debug!("RetentionManager: evicted {} log entries", removed);
    }
    journal.flush_if_dirty();
}
