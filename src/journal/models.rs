//! Transition log model types.

use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Subject used for events that belong to the monitor itself.
pub const SYSTEM_SUBJECT: &str = "system";

/// Timestamp format of persisted log lines.
pub const LOG_TIME_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

/// Host names are padded to this width in the persisted log.
pub const SUBJECT_WIDTH: usize = 27;

/// Health color of a single observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    /// Reply at or above the dock threshold.
    Green,
    /// Reply faster than the dock threshold.
    Yellow,
    /// No usable reply.
    Red,
    /// Probing paused.
    Gray,
}

impl Color {
    /// Parse a color name. Anything unrecognized is treated as red.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "green" => Color::Green,
            "yellow" => Color::Yellow,
            "gray" | "grey" => Color::Gray,
            _ => Color::Red,
        }
    }
}

/// A logged change of a host's stable color, or a monitor lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionKind {
    RedToYellow,
    RedToGreen,
    YellowToRed,
    YellowToGreen,
    GreenToRed,
    GreenToYellow,
    MonitorStarted,
    MonitorStopped,
}

impl TransitionKind {
    const ALL: [TransitionKind; 8] = [
        TransitionKind::RedToYellow,
        TransitionKind::RedToGreen,
        TransitionKind::YellowToRed,
        TransitionKind::YellowToGreen,
        TransitionKind::GreenToRed,
        TransitionKind::GreenToYellow,
        TransitionKind::MonitorStarted,
        TransitionKind::MonitorStopped,
    ];

    /// Transition logged when the stable color moves from `from` to `to`.
    ///
    /// Pairs without a semantic transition (same color, or anything
    /// involving gray) map to `None`.
    pub fn between(from: Color, to: Color) -> Option<Self> {
        use Color::*;
        match (from, to) {
            (Red, Yellow) => Some(TransitionKind::RedToYellow),
            (Red, Green) => Some(TransitionKind::RedToGreen),
            (Yellow, Red) => Some(TransitionKind::YellowToRed),
            (Yellow, Green) => Some(TransitionKind::YellowToGreen),
            (Green, Red) => Some(TransitionKind::GreenToRed),
            (Green, Yellow) => Some(TransitionKind::GreenToYellow),
            (Red, Red) | (Yellow, Yellow) | (Green, Green) => None,
            (Gray, _) | (_, Gray) => None,
        }
    }

    pub fn text(&self) -> &'static str {
        match self {
            TransitionKind::RedToYellow => "reached dock after going down",
            TransitionKind::RedToGreen => "came up",
            TransitionKind::YellowToRed => "left dock and went down",
            TransitionKind::YellowToGreen => "left dock and came up",
            TransitionKind::GreenToRed => "went down",
            TransitionKind::GreenToYellow => "moved to dock",
            TransitionKind::MonitorStarted => "started",
            TransitionKind::MonitorStopped => "closed successfully",
        }
    }

    pub fn from_text(text: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.text() == text)
    }

    /// Yellow/red flapping, suppressed when dock changes are ignored.
    pub fn is_dock_flap(&self) -> bool {
        matches!(self, TransitionKind::RedToYellow | TransitionKind::YellowToRed)
    }

    pub fn improved_to_green(&self) -> bool {
        matches!(self, TransitionKind::RedToGreen | TransitionKind::YellowToGreen)
    }

    pub fn degraded_from_green(&self) -> bool {
        matches!(self, TransitionKind::GreenToRed | TransitionKind::GreenToYellow)
    }

    /// Stable color a host is in after this transition.
    pub fn target_color(&self) -> Option<Color> {
        match self {
            TransitionKind::YellowToRed | TransitionKind::GreenToRed => Some(Color::Red),
            TransitionKind::RedToYellow | TransitionKind::GreenToYellow => Some(Color::Yellow),
            TransitionKind::RedToGreen | TransitionKind::YellowToGreen => Some(Color::Green),
            TransitionKind::MonitorStarted | TransitionKind::MonitorStopped => None,
        }
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

/// One entry of the transition log.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionEvent {
    pub time: NaiveDateTime,
    pub host_name: String,
    pub kind: TransitionKind,
}

impl TransitionEvent {
    /// Render as a persisted log line, without the trailing newline.
    pub fn to_line(&self) -> String {
        format!(
            "{} - {:<width$} - {}",
            self.time.format(LOG_TIME_FORMAT),
            self.host_name,
            self.kind.text(),
            width = SUBJECT_WIDTH
        )
    }

    /// Parse a persisted log line. Returns `None` for malformed lines.
    pub fn parse_line(line: &str) -> Option<Self> {
        static LINE: OnceLock<Regex> = OnceLock::new();
        let re = LINE.get_or_init(|| {
            Regex::new(r"^(?P<time>\d{2}\.\d{2}\.\d{4} \d{2}:\d{2}:\d{2}) - (?P<host>.*) - (?P<text>.*)$")
                .unwrap()
        });

        let caps = re.captures(line.trim_end_matches(['\r', '\n']))?;
        let time = NaiveDateTime::parse_from_str(&caps["time"], LOG_TIME_FORMAT).ok()?;
        let host_name = caps["host"].trim_end().to_string();
        let kind = TransitionKind::from_text(&caps["text"])?;
        if host_name.is_empty() {
            return None;
        }

        Some(Self {
            time,
            host_name,
            kind,
        })
    }
}
