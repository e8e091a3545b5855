//! File-backed transition log store.
//!
//! The whole log lives in memory; the file is rewritten in full on flush.
//! Persistence is best-effort: read failures give a cold start and write
//! failures are logged and retried on the next flush.

use chrono::{Duration as ChronoDuration, Local, NaiveDateTime};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use super::models::*;

/// Journal error types.
#[derive(Error, Debug)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Last green-family transition of a host, used to seed its state on startup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Recovery {
    pub kind: TransitionKind,
    pub time: NaiveDateTime,
}

struct LogState {
    events: VecDeque<TransitionEvent>,
    dirty: bool,
}

/// Thread-safe transition log.
#[derive(Clone)]
pub struct Journal {
    path: PathBuf,
    state: Arc<Mutex<LogState>>,
}

impl Journal {
    /// Open the log at `path`, loading any events already persisted there.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let events = match read_events(&path) {
            Ok(events) => events,
            Err(JournalError::Io(e)) if e.kind() == ErrorKind::NotFound => VecDeque::new(),
            Err(e) => {
                tracing::warn!("Journal: failed to read {}: {}", path.display(), e);
                VecDeque::new()
            }
        };
        tracing::info!("Journal: loaded {} events from {}", events.len(), path.display());

        Self {
            path,
            state: Arc::new(Mutex::new(LogState {
                events,
                dirty: false,
            })),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an event stamped with the current local time.
    pub fn append(&self, host_name: &str, kind: TransitionKind) {
        self.append_at(Local::now().naive_local(), host_name, kind);
    }

    pub fn append_at(&self, time: NaiveDateTime, host_name: &str, kind: TransitionKind) {
        let mut state = self.lock();
        state.events.push_back(TransitionEvent {
            time,
            host_name: host_name.to_string(),
            kind,
        });
        state.dirty = true;
    }

    /// Rewrite the file if anything changed since the last flush.
    ///
    /// Returns whether the file was written.
    pub fn flush_if_dirty(&self) -> bool {
        let mut state = self.lock();
        if !state.dirty {
            return false;
        }

        match std::fs::write(&self.path, render_events(&state.events)) {
            Ok(()) => {
                state.dirty = false;
                true
            }
            Err(e) => {
                tracing::warn!("Journal: failed to write {}: {}", self.path.display(), e);
                false
            }
        }
    }

    /// Drop events older than `retention_hours`, oldest first.
    ///
    /// Returns the number of events removed.
    pub fn evict_expired(&self, retention_hours: u64, now: NaiveDateTime) -> usize {
        let hours = i64::try_from(retention_hours).unwrap_or(i64::MAX);
        let cutoff = ChronoDuration::try_hours(hours)
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(NaiveDateTime::MIN);

        let mut state = self.lock();
        let mut removed = 0;
        while state.events.front().is_some_and(|event| event.time < cutoff) {
            state.events.pop_front();
            removed += 1;
        }
        if removed > 0 {
            state.dirty = true;
        }
        removed
    }

    /// Most recent transition into or out of green, per host.
    pub fn replay_for_recovery(&self) -> HashMap<String, Recovery> {
        let state = self.lock();
        let mut recovered = HashMap::new();
        for event in &state.events {
            if event.kind.improved_to_green() || event.kind.degraded_from_green() {
                recovered.insert(
                    event.host_name.clone(),
                    Recovery {
                        kind: event.kind,
                        time: event.time,
                    },
                );
            }
        }
        recovered
    }

    pub fn events(&self) -> Vec<TransitionEvent> {
        self.lock().events.iter().cloned().collect()
    }

    /// Distinct host names present in the log, sorted.
    pub fn host_names(&self) -> Vec<String> {
        let state = self.lock();
        let names: BTreeSet<&str> = state
            .events
            .iter()
            .map(|event| event.host_name.as_str())
            .collect();
        names.into_iter().map(str::to_string).collect()
    }

    /// The log as it is persisted.
    pub fn render(&self) -> String {
        render_events(&self.lock().events)
    }
}

fn read_events(path: &Path) -> Result<VecDeque<TransitionEvent>, JournalError> {
    let content = std::fs::read_to_string(path)?;
    Ok(content.lines().filter_map(TransitionEvent::parse_line).collect())
}

fn render_events(events: &VecDeque<TransitionEvent>) -> String {
    let mut out = String::new();
    for event in events {
        out.push_str(&event.to_line());
        out.push('\n');
    }
    out
}
