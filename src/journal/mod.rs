//! Transition log module.
//!
//! Append-only record of host health changes, retained for a bounded number
//! of hours and replayed at startup to recover each host's last status.

mod models;
mod store;

pub use models::*;
pub use store::*;
