//! Per-host probe loop.
//!
//! A worker owns its transport and health machine. It reads control and
//! configuration through watch channels at the top of every cycle and
//! publishes results through its snapshot and display-line channels only.

use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Instant;
use tokio::sync::{broadcast, watch};

use super::health::{classify, HealthMachine};
use crate::config::MonitorConfig;
use crate::journal::{Color, Journal};
use crate::probe::{probe_once, resolve_within, ProbeOutcome, Transport};

/// Registry-assigned identifier of a monitored host.
pub type HostId = u32;

const LINE_TIME_FORMAT: &str = "%d.%m.%y %H:%M:%S";

/// Control state published by the registry to one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct HostControl {
    pub host_name: String,
    pub address: String,
    pub paused: bool,
    pub alive: bool,
}

/// What the display surface shows for one host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostSnapshot {
    pub id: HostId,
    pub color: Option<Color>,
    pub host_name: String,
    pub address: String,
    pub status: String,
    pub statistics: String,
}

impl HostSnapshot {
    pub(crate) fn new(id: HostId, host: &HostControl, machine: &HealthMachine) -> Self {
        Self {
            id,
            color: machine.color(),
            host_name: host.host_name.clone(),
            address: host.address.clone(),
            status: machine.status_text(),
            statistics: machine.statistics().to_string(),
        }
    }
}

/// One line of a host's detail view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayLine {
    pub time: NaiveDateTime,
    pub color: Color,
    pub text: String,
}

impl fmt::Display for DisplayLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.time.format(LINE_TIME_FORMAT), self.text)
    }
}

pub(crate) struct Worker {
    pub id: HostId,
    pub transport: Box<dyn Transport>,
    pub machine: HealthMachine,
    pub control: watch::Receiver<HostControl>,
    pub config: watch::Receiver<MonitorConfig>,
    pub running: watch::Receiver<bool>,
    pub snapshots: watch::Sender<HostSnapshot>,
    pub lines: broadcast::Sender<DisplayLine>,
    pub journal: Journal,
}

impl Worker {
    /// Probe until the global running flag clears or the host is removed.
    pub async fn run(self) {
        let Worker {
            id,
            transport,
            mut machine,
            mut control,
            config,
            mut running,
            snapshots,
            lines,
            journal,
        } = self;

        let mut transport = Some(transport);
        let mut address = control.borrow().address.clone();
        let mut resolved: Option<Ipv4Addr> = None;

        loop {
            if !*running.borrow_and_update() {
                break;
            }
            let host = control.borrow_and_update().clone();
            if !host.alive {
                break;
            }
            let cfg = config.borrow().clone();
            let started = Instant::now();

            if host.address != address {
                tracing::info!("Monitor {}: address changed to {}", host.host_name, host.address);
                address = host.address.clone();
                resolved = None;
                machine.reset();
            }

            let color = if host.paused {
                Color::Gray
            } else {
                let target_ip = match resolved {
                    Some(ip) => Some(ip),
                    None => {
                        let lookup = tokio::select! {
                            result = resolve_within(&address, cfg.probe_params().timeout) => result,
                            _ = running.changed() => break,
                        };
                        match lookup {
                            Ok(ip) => {
                                resolved = Some(ip);
                                Some(ip)
                            }
                            Err(e) => {
                                tracing::debug!("Monitor {}: {}", host.host_name, e);
                                None
                            }
                        }
                    }
                };
                let outcome = match target_ip {
                    Some(ip) => {
                        let Some(mut probe) = transport.take() else {
                            break;
                        };
                        let params = cfg.probe_params();
                        match tokio::task::spawn_blocking(move || {
                            let outcome = probe_once(probe.as_mut(), ip, &params);
                            (probe, outcome)
                        })
                        .await
                        {
                            Ok((probe, outcome)) => {
                                transport = Some(probe);
                                outcome
                            }
                            Err(e) => {
                                tracing::error!("Monitor {}: probe task failed: {}", host.host_name, e);
                                break;
                            }
                        }
                    }
                    None => ProbeOutcome::failure(format!(
                        "Ping request could not find host {}.",
                        address
                    )),
                };

                let color = classify(&outcome, cfg.dock_threshold_ms);
                let line = DisplayLine {
                    time: Local::now().naive_local(),
                    color,
                    text: outcome.description,
                };
                // No subscribers is fine
                let _ = lines.send(line);
                color
            };

            let now = Local::now().naive_local();
            if let Some(kind) = machine.observe(color, &cfg.health_policy(), now) {
                tracing::info!("Monitor {}: {}", host.host_name, kind);
                journal.append(&host.host_name, kind);
            }
            snapshots.send_replace(HostSnapshot::new(id, &host, &machine));

            let wait = cfg.interval().saturating_sub(started.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = control.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = running.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        // Dropping the transport closes its socket
        drop(transport);
        tracing::info!("Monitor {}: stopped", id);
    }
}
