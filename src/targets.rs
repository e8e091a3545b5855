//! Target list import and export.
//!
//! One `host->address` pair per line.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const DELIMITER: &str = "->";

/// A monitored host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub host_name: String,
    pub address: String,
}

impl Target {
    pub fn new(host_name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            address: address.into(),
        }
    }
}

/// Target file error types.
#[derive(Error, Debug)]
pub enum TargetFileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: expected host->address, got {content:?}")]
    Malformed { line: usize, content: String },
}

/// Parse a target list. Any malformed line rejects the whole list.
pub fn parse_targets(content: &str) -> Result<Vec<Target>, TargetFileError> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            let mut parts = line.split(DELIMITER);
            match (parts.next(), parts.next(), parts.next()) {
                (Some(host), Some(address), None) if !host.is_empty() && !address.is_empty() => {
                    Ok(Target::new(host, address))
                }
                _ => Err(TargetFileError::Malformed {
                    line: index + 1,
                    content: line.to_string(),
                }),
            }
        })
        .collect()
}

pub fn load_targets<P: AsRef<Path>>(path: P) -> Result<Vec<Target>, TargetFileError> {
    parse_targets(&std::fs::read_to_string(path)?)
}

/// Render a target list, skipping incomplete entries.
pub fn render_targets(targets: &[Target]) -> String {
    targets
        .iter()
        .filter(|t| !t.host_name.is_empty() && !t.address.is_empty())
        .map(|t| format!("{}{}{}\n", t.host_name, DELIMITER, t.address))
        .collect()
}

pub fn save_targets<P: AsRef<Path>>(path: P, targets: &[Target]) -> Result<(), TargetFileError> {
    std::fs::write(path, render_targets(targets))?;
    Ok(())
}
