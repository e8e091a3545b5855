//! Debounced health state machine for a single host.
//!
//! Status follows every raw observation immediately. Log events only fire
//! once the raw color has held for [`DEBOUNCE_SAMPLES`] observations and
//! differs from the last stable color.

use chrono::NaiveDateTime;
use std::collections::VecDeque;
use std::fmt;

use super::stats::StatisticsRing;
use crate::journal::{Color, Recovery, TransitionKind};
use crate::probe::ProbeOutcome;

/// Consecutive identical observations needed before a color is stable.
pub const DEBOUNCE_SAMPLES: usize = 2;

const STATUS_TIME_FORMAT: &str = "%d.%m.%y %H:%M:%S";

/// Host status shown next to the color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Calculating,
    Online,
    Offline,
    Paused,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Calculating => "Calculating...",
            Status::Online => "Online",
            Status::Offline => "Offline",
            Status::Paused => "Paused",
        })
    }
}

/// Settings read on every observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthPolicy {
    pub statistics_capacity: usize,
    pub ignore_dock_in_log: bool,
}

/// Color of a probe outcome. Replies faster than the dock threshold are
/// suspicious and count as yellow.
pub fn classify(outcome: &ProbeOutcome, dock_threshold_ms: u64) -> Color {
    match outcome.rtt_ms {
        Some(rtt) if outcome.success => {
            if u64::from(rtt) < dock_threshold_ms {
                Color::Yellow
            } else {
                Color::Green
            }
        }
        _ => Color::Red,
    }
}

#[derive(Debug, Clone, Default)]
struct DebounceWindow {
    samples: VecDeque<Color>,
}

impl DebounceWindow {
    fn push(&mut self, color: Color) {
        if self.samples.len() == DEBOUNCE_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(color);
    }

    fn stable(&self) -> Option<Color> {
        let first = *self.samples.front()?;
        (self.samples.len() == DEBOUNCE_SAMPLES && self.samples.iter().all(|&c| c == first))
            .then_some(first)
    }
}

/// Health of one host: color, status, statistics and the debounce window.
#[derive(Debug, Clone)]
pub struct HealthMachine {
    status: Status,
    since: Option<NaiveDateTime>,
    color: Option<Color>,
    window: DebounceWindow,
    declared: Option<Color>,
    stats: StatisticsRing,
}

impl HealthMachine {
    pub fn new(statistics_capacity: usize) -> Self {
        Self {
            status: Status::Calculating,
            since: None,
            color: None,
            window: DebounceWindow::default(),
            declared: None,
            stats: StatisticsRing::new(statistics_capacity),
        }
    }

    /// Seed a machine from the host's last green-family log entry.
    pub fn recovered(statistics_capacity: usize, recovery: &Recovery) -> Self {
        let mut machine = Self::new(statistics_capacity);
        if recovery.kind.improved_to_green() {
            machine.status = Status::Online;
        } else if recovery.kind.degraded_from_green() {
            machine.status = Status::Offline;
        } else {
            return machine;
        }
        machine.since = Some(recovery.time);
        machine.declared = recovery.kind.target_color();
        machine
    }

    /// Feed one raw observation. Returns the transition to log, if any.
    pub fn observe(
        &mut self,
        color: Color,
        policy: &HealthPolicy,
        now: NaiveDateTime,
    ) -> Option<TransitionKind> {
        self.color = Some(color);
        match color {
            Color::Green => {
                self.set_status(Status::Online, now);
                self.stats.record(true, policy.statistics_capacity);
            }
            Color::Red | Color::Yellow => {
                self.set_status(Status::Offline, now);
                self.stats.record(false, policy.statistics_capacity);
            }
            Color::Gray => self.set_status(Status::Paused, now),
        }

        self.window.push(color);
        let stable = self.window.stable()?;
        if self.declared == Some(stable) {
            return None;
        }
        let previous = self.declared.replace(stable)?;
        let kind = TransitionKind::between(previous, stable)?;
        if policy.ignore_dock_in_log && kind.is_dock_flap() {
            return None;
        }
        Some(kind)
    }

    fn set_status(&mut self, status: Status, now: NaiveDateTime) {
        if self.status != status {
            self.status = status;
            self.since = Some(now);
        }
    }

    /// Forget everything, as after an address change.
    pub fn reset(&mut self) {
        *self = Self::new(self.stats.capacity());
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn since(&self) -> Option<NaiveDateTime> {
        self.since
    }

    pub fn color(&self) -> Option<Color> {
        self.color
    }

    pub fn statistics(&self) -> &StatisticsRing {
        &self.stats
    }

    /// Status as displayed, e.g. `Online since 07.07.24 10:00:00`.
    pub fn status_text(&self) -> String {
        match (self.status, self.since) {
            (Status::Calculating, _) | (_, None) => self.status.to_string(),
            (status, Some(since)) => {
                format!("{} since {}", status, since.format(STATUS_TIME_FORMAT))
            }
        }
    }
}
