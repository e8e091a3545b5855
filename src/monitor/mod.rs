//! Monitor module: per-host workers and the registry that owns them.

mod health;
mod retention;
mod stats;
mod worker;

pub use health::*;
pub use retention::*;
pub use stats::*;
pub use worker::*;

use crate::config::MonitorConfig;
use crate::journal::Journal;
use crate::probe::{IcmpTransport, ProbeError, Transport};
use crate::targets::Target;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;

/// Display lines kept for slow detail-view subscribers.
const LINE_BUFFER: usize = 256;

/// Opens a transport for a given ICMP identifier.
pub type Connector = Arc<dyn Fn(u16) -> Result<Box<dyn Transport>, ProbeError> + Send + Sync>;

/// Registry error types.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("unknown host id {0}")]
    UnknownHost(HostId),
    #[error("invalid host name {0:?}")]
    InvalidHostName(String),
    #[error("monitor is shutting down")]
    ShuttingDown,
}

struct HostEntry {
    control: watch::Sender<HostControl>,
    snapshot: watch::Receiver<HostSnapshot>,
    lines: broadcast::Sender<DisplayLine>,
    task: JoinHandle<()>,
}

/// Owns every host monitor and is the entry point for display actions.
pub struct Registry {
    config: watch::Receiver<MonitorConfig>,
    running: watch::Sender<bool>,
    journal: Journal,
    connector: Connector,
    hosts: RwLock<BTreeMap<HostId, HostEntry>>,
    next_id: AtomicU32,
    identifier_base: u16,
}

impl Registry {
    /// Create a registry that probes over native ICMP sockets.
    pub fn new(config: watch::Receiver<MonitorConfig>, journal: Journal) -> Self {
        let connector: Connector = Arc::new(|identifier| {
            let transport = IcmpTransport::open(identifier)?;
            Ok(Box::new(transport) as Box<dyn Transport>)
        });
        Self::with_connector(config, journal, connector)
    }

    pub fn with_connector(
        config: watch::Receiver<MonitorConfig>,
        journal: Journal,
        connector: Connector,
    ) -> Self {
        let (running, _) = watch::channel(true);

        Self {
            config,
            running,
            journal,
            connector,
            hosts: RwLock::new(BTreeMap::new()),
            next_id: AtomicU32::new(1),
            identifier_base: rand::random(),
        }
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Start monitoring a host.
    ///
    /// Fails if no transport can be opened, e.g. for lack of privilege.
    pub async fn add(&self, host_name: &str, address: &str) -> Result<HostId, MonitorError> {
        if !self.is_running() {
            return Err(MonitorError::ShuttingDown);
        }
        check_host_name(host_name)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let identifier = self.identifier_base.wrapping_add(id as u16);
        let transport = (self.connector)(identifier)?;

        let capacity = self.config.borrow().statistics_capacity;
        // The live log, so a host added back later sees this session's events
        let machine = match self.journal.replay_for_recovery().get(host_name) {
            Some(recovery) => HealthMachine::recovered(capacity, recovery),
            None => HealthMachine::new(capacity),
        };
        let host = HostControl {
            host_name: host_name.to_string(),
            address: address.to_string(),
            paused: false,
            alive: true,
        };

        let (snapshot_tx, snapshot_rx) = watch::channel(HostSnapshot::new(id, &host, &machine));
        let (control_tx, control_rx) = watch::channel(host);
        let (lines_tx, _) = broadcast::channel(LINE_BUFFER);

        let worker = Worker {
            id,
            transport,
            machine,
            control: control_rx,
            config: self.config.clone(),
            running: self.running.subscribe(),
            snapshots: snapshot_tx,
            lines: lines_tx.clone(),
            journal: self.journal.clone(),
        };
        let task = tokio::spawn(worker.run());

        self.hosts.write().await.insert(
            id,
            HostEntry {
                control: control_tx,
                snapshot: snapshot_rx,
                lines: lines_tx,
                task,
            },
        );
        tracing::info!("Registry: added {} ({}) as {}", host_name, address, id);

        Ok(id)
    }

    /// Stop monitoring a host and wait for its worker to exit.
    pub async fn remove(&self, id: HostId) -> Result<(), MonitorError> {
        let entry = self
            .hosts
            .write()
            .await
            .remove(&id)
            .ok_or(MonitorError::UnknownHost(id))?;
        stop_all(vec![entry]).await;
        tracing::info!("Registry: removed {}", id);
        Ok(())
    }

    /// Remove every host.
    pub async fn reset(&self) {
        let entries = std::mem::take(&mut *self.hosts.write().await);
        stop_all(entries.into_values().collect()).await;
    }

    /// Clear the global running flag and join every worker.
    pub async fn shutdown(&self) {
        self.running.send_replace(false);
        self.reset().await;
        tracing::info!("Registry: all monitors stopped");
    }

    async fn update<F>(&self, id: HostId, modify: F) -> Result<(), MonitorError>
    where
        F: FnOnce(&mut HostControl),
    {
        let hosts = self.hosts.read().await;
        let entry = hosts.get(&id).ok_or(MonitorError::UnknownHost(id))?;
        entry.control.send_modify(modify);
        Ok(())
    }

    pub async fn pause(&self, id: HostId) -> Result<(), MonitorError> {
        self.update(id, |host| host.paused = true).await
    }

    pub async fn resume(&self, id: HostId) -> Result<(), MonitorError> {
        self.update(id, |host| host.paused = false).await
    }

    pub async fn toggle_pause(&self, id: HostId) -> Result<(), MonitorError> {
        self.update(id, |host| host.paused = !host.paused).await
    }

    /// Rename a host and/or point it at a new address. A new address resets
    /// its statistics and status on the worker's next cycle.
    pub async fn edit(&self, id: HostId, host_name: &str, address: &str) -> Result<(), MonitorError> {
        check_host_name(host_name)?;
        self.update(id, |host| {
            host.host_name = host_name.to_string();
            host.address = address.to_string();
        })
        .await
    }

    /// Latest snapshot of every live host, in insertion order.
    pub async fn snapshots(&self) -> Vec<HostSnapshot> {
        self.hosts
            .read()
            .await
            .values()
            .map(|entry| entry.snapshot.borrow().clone())
            .collect()
    }

    pub async fn snapshot(&self, id: HostId) -> Option<HostSnapshot> {
        self.hosts
            .read()
            .await
            .get(&id)
            .map(|entry| entry.snapshot.borrow().clone())
    }

    /// Stream of display lines for one host's detail view.
    pub async fn subscribe(&self, id: HostId) -> Result<broadcast::Receiver<DisplayLine>, MonitorError> {
        self.hosts
            .read()
            .await
            .get(&id)
            .map(|entry| entry.lines.subscribe())
            .ok_or(MonitorError::UnknownHost(id))
    }

    /// Current target list, for export.
    pub async fn targets(&self) -> Vec<Target> {
        self.hosts
            .read()
            .await
            .values()
            .map(|entry| {
                let host = entry.control.borrow();
                Target::new(host.host_name.clone(), host.address.clone())
            })
            .collect()
    }
}

/// Host names are written padded into the transition log and must read back
/// unchanged.
fn check_host_name(host_name: &str) -> Result<(), MonitorError> {
    if host_name.trim().is_empty()
        || host_name.ends_with(char::is_whitespace)
        || host_name.chars().any(char::is_control)
    {
        return Err(MonitorError::InvalidHostName(host_name.to_string()));
    }
    Ok(())
}

/// Signal every worker first, then join them.
async fn stop_all(entries: Vec<HostEntry>) {
    for entry in &entries {
        entry.control.send_modify(|host| host.alive = false);
    }
    for entry in entries {
        if let Err(e) = entry.task.await {
            tracing::error!("Registry: monitor task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::TransitionKind;
    use crate::probe::{ProbeOutcome, ProbeParams};
    use chrono::NaiveDate;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    type Responder = Arc<dyn Fn(Ipv4Addr) -> ProbeOutcome + Send + Sync>;

    struct ScriptedTransport {
        respond: Responder,
        address: Ipv4Addr,
        sent: bool,
    }

    impl Transport for ScriptedTransport {
        fn set_address(&mut self, address: Ipv4Addr) {
            self.address = address;
        }

        fn send(&mut self, _params: &ProbeParams) -> Result<(), ProbeError> {
            self.sent = true;
            Ok(())
        }

        fn receive(&mut self) -> ProbeOutcome {
            if !std::mem::take(&mut self.sent) {
                return ProbeOutcome::failure("nothing sent");
            }
            (self.respond)(self.address)
        }
    }

    fn scripted(respond: Responder) -> Connector {
        Arc::new(move |_identifier| {
            Ok(Box::new(ScriptedTransport {
                respond: respond.clone(),
                address: Ipv4Addr::UNSPECIFIED,
                sent: false,
            }) as Box<dyn Transport>)
        })
    }

    fn always_up() -> Responder {
        Arc::new(|ip| ProbeOutcome::reply(150, format!("Reply from {}: time=150ms", ip)))
    }

    fn test_config() -> MonitorConfig {
        MonitorConfig {
            interval_ms: 5,
            timeout_ms: 50,
            dock_threshold_ms: 100,
            ..Default::default()
        }
    }

    fn setup(respond: Responder) -> (TempDir, Journal, watch::Sender<MonitorConfig>, Registry) {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(dir.path().join("log.txt"));
        let (config_tx, config_rx) = watch::channel(test_config());
        let registry = Registry::with_connector(config_rx, journal.clone(), scripted(respond));
        (dir, journal, config_tx, registry)
    }

    async fn wait_for<F>(registry: &Registry, id: HostId, pred: F) -> HostSnapshot
    where
        F: Fn(&HostSnapshot) -> bool,
    {
        for _ in 0..400 {
            if let Some(snapshot) = registry.snapshot(id).await {
                if pred(&snapshot) {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("host {} never reached the expected state", id);
    }

    #[tokio::test]
    async fn test_add_goes_online() {
        let (_dir, _journal, _config, registry) = setup(always_up());
        let id = registry.add("router", "192.168.1.1").await.unwrap();

        let snapshot = wait_for(&registry, id, |s| s.status.starts_with("Online")).await;
        assert_eq!(snapshot.color, Some(crate::journal::Color::Green));
        assert_eq!(snapshot.host_name, "router");
        assert_eq!(snapshot.address, "192.168.1.1");
        assert_eq!(snapshot.statistics, "100%");

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_timeouts_log_transition_once() {
        let probes = Arc::new(AtomicUsize::new(0));
        let counter = probes.clone();
        let respond: Responder = Arc::new(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                ProbeOutcome::reply(150, "up")
            } else {
                ProbeOutcome::timed_out()
            }
        });
        let (_dir, journal, _config, registry) = setup(respond);
        let id = registry.add("router", "10.0.0.1").await.unwrap();

        wait_for(&registry, id, |s| s.status.starts_with("Offline")).await;
        while probes.load(Ordering::SeqCst) < 10 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        registry.shutdown().await;

        let events: Vec<TransitionKind> = journal
            .events()
            .into_iter()
            .filter(|e| e.host_name == "router")
            .map(|e| e.kind)
            .collect();
        assert_eq!(events, vec![TransitionKind::GreenToRed]);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let (_dir, _journal, _config, registry) = setup(always_up());
        let id = registry.add("router", "10.0.0.1").await.unwrap();
        wait_for(&registry, id, |s| s.status.starts_with("Online")).await;

        registry.pause(id).await.unwrap();
        let paused = wait_for(&registry, id, |s| s.status.starts_with("Paused")).await;
        assert_eq!(paused.color, Some(crate::journal::Color::Gray));

        registry.toggle_pause(id).await.unwrap();
        wait_for(&registry, id, |s| s.status.starts_with("Online")).await;

        registry.pause(id).await.unwrap();
        wait_for(&registry, id, |s| s.status.starts_with("Paused")).await;
        registry.resume(id).await.unwrap();
        wait_for(&registry, id, |s| s.status.starts_with("Online")).await;

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_edit_address_resets_state() {
        let respond: Responder = Arc::new(|ip| {
            if ip == Ipv4Addr::new(10, 0, 0, 2) {
                ProbeOutcome::reply(150, "up")
            } else {
                ProbeOutcome::timed_out()
            }
        });
        let (_dir, journal, _config, registry) = setup(respond);
        let id = registry.add("router", "10.0.0.1").await.unwrap();
        wait_for(&registry, id, |s| s.status.starts_with("Offline")).await;

        registry.edit(id, "gateway", "10.0.0.2").await.unwrap();
        let snapshot = wait_for(&registry, id, |s| s.status.starts_with("Online")).await;
        assert_eq!(snapshot.host_name, "gateway");
        assert_eq!(snapshot.address, "10.0.0.2");
        // Failures recorded under the old address are gone
        assert_eq!(snapshot.statistics, "100%");

        registry.shutdown().await;
        // No baseline after the reset, so nothing was logged
        assert!(journal.events().is_empty());
    }

    #[tokio::test]
    async fn test_remove_and_unknown_hosts() {
        let (_dir, _journal, _config, registry) = setup(always_up());
        let first = registry.add("router", "10.0.0.1").await.unwrap();
        let second = registry.add("switch", "10.0.0.2").await.unwrap();
        assert_eq!(
            registry.targets().await,
            vec![Target::new("router", "10.0.0.1"), Target::new("switch", "10.0.0.2")]
        );

        registry.remove(first).await.unwrap();
        let snapshots = registry.snapshots().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].id, second);

        assert!(matches!(
            registry.remove(first).await,
            Err(MonitorError::UnknownHost(_))
        ));
        assert!(matches!(
            registry.pause(first).await,
            Err(MonitorError::UnknownHost(_))
        ));
        assert!(registry.subscribe(first).await.is_err());

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_recovered_status_seeds_new_host() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(dir.path().join("log.txt"));
        let since = NaiveDate::from_ymd_opt(2024, 7, 7)
            .unwrap()
            .and_hms_opt(8, 30, 0)
            .unwrap();
        journal.append_at(since, "router", TransitionKind::RedToGreen);

        let (_config_tx, config_rx) = watch::channel(test_config());
        let registry = Registry::with_connector(config_rx, journal.clone(), scripted(always_up()));
        let id = registry.add("router", "10.0.0.1").await.unwrap();
        let other = registry.add("switch", "10.0.0.2").await.unwrap();

        let snapshot = registry.snapshot(id).await.unwrap();
        assert_eq!(snapshot.status, "Online since 07.07.24 08:30:00");
        // Hosts without history start from scratch
        assert!(!registry
            .snapshot(other)
            .await
            .unwrap()
            .status
            .contains("07.07.24"));

        // Staying green keeps the recovered timestamp
        wait_for(&registry, id, |s| s.statistics == "100%").await;
        assert_eq!(
            registry.snapshot(id).await.unwrap().status,
            "Online since 07.07.24 08:30:00"
        );

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_readded_host_recovers_from_this_session() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(dir.path().join("log.txt"));
        let since = NaiveDate::from_ymd_opt(2024, 7, 7)
            .unwrap()
            .and_hms_opt(8, 30, 0)
            .unwrap();
        journal.append_at(since, "router", TransitionKind::RedToGreen);

        let probes = Arc::new(AtomicUsize::new(0));
        let counter = probes.clone();
        let respond: Responder = Arc::new(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                ProbeOutcome::reply(150, "up")
            } else {
                ProbeOutcome::timed_out()
            }
        });
        let (_config_tx, config_rx) = watch::channel(test_config());
        let registry = Registry::with_connector(config_rx, journal.clone(), scripted(respond));

        let id = registry.add("router", "10.0.0.1").await.unwrap();
        for _ in 0..400 {
            if journal.events().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        registry.remove(id).await.unwrap();

        let id = registry.add("router", "10.0.0.1").await.unwrap();
        let snapshot = registry.snapshot(id).await.unwrap();
        assert!(snapshot.status.starts_with("Offline since"));
        assert!(!snapshot.status.contains("08:30:00"));

        let seen = probes.load(Ordering::SeqCst);
        while probes.load(Ordering::SeqCst) < seen + 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        registry.shutdown().await;

        let kinds: Vec<TransitionKind> = journal.events().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![TransitionKind::RedToGreen, TransitionKind::GreenToRed]);
    }

    #[tokio::test]
    async fn test_unresolvable_address_goes_offline() {
        let (_dir, _journal, _config, registry) = setup(always_up());
        let id = registry.add("nowhere", "nowhere.invalid").await.unwrap();
        let mut lines = registry.subscribe(id).await.unwrap();

        let line = tokio::time::timeout(Duration::from_secs(5), lines.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.color, crate::journal::Color::Red);
        assert_eq!(line.text, "Ping request could not find host nowhere.invalid.");
        wait_for(&registry, id, |s| s.status.starts_with("Offline")).await;

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejects_unloggable_host_names() {
        let (_dir, _journal, _config, registry) = setup(always_up());
        for name in ["", "   ", "router ", "rou\nter", "tab\t"] {
            assert!(
                matches!(
                    registry.add(name, "10.0.0.1").await,
                    Err(MonitorError::InvalidHostName(_))
                ),
                "{:?}",
                name
            );
        }
        assert!(registry.snapshots().await.is_empty());

        let id = registry.add(" core router", "10.0.0.1").await.unwrap();
        assert!(matches!(
            registry.edit(id, "core router\r", "10.0.0.1").await,
            Err(MonitorError::InvalidHostName(_))
        ));
        assert_eq!(
            registry.snapshot(id).await.unwrap().host_name,
            " core router"
        );

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_display_lines_stream() {
        let (_dir, _journal, _config, registry) = setup(always_up());
        let id = registry.add("router", "10.0.0.1").await.unwrap();
        let mut lines = registry.subscribe(id).await.unwrap();

        let line = tokio::time::timeout(Duration::from_secs(2), lines.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.color, crate::journal::Color::Green);
        assert!(line.to_string().contains("-> Reply from 10.0.0.1"));

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_statistics_capacity_change_applies() {
        let (_dir, _journal, config, registry) = setup(always_up());
        let id = registry.add("router", "10.0.0.1").await.unwrap();
        wait_for(&registry, id, |s| s.statistics == "100%").await;

        // Everything is suspiciously fast now, and the window shrinks
        config.send_modify(|cfg| {
            cfg.dock_threshold_ms = 1000;
            cfg.statistics_capacity = 4;
        });
        wait_for(&registry, id, |s| s.statistics == "000%").await;
        let snapshot = wait_for(&registry, id, |s| s.status.starts_with("Offline")).await;
        assert_eq!(snapshot.color, Some(crate::journal::Color::Yellow));

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_hosts() {
        let (_dir, _journal, _config, registry) = setup(always_up());
        registry.add("router", "10.0.0.1").await.unwrap();
        registry.add("switch", "10.0.0.2").await.unwrap();

        registry.shutdown().await;
        assert!(!registry.is_running());
        assert!(registry.snapshots().await.is_empty());
        assert!(matches!(
            registry.add("ap", "10.0.0.3").await,
            Err(MonitorError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_transport_failure_surfaces() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(dir.path().join("log.txt"));
        let (_config_tx, config_rx) = watch::channel(test_config());
        let connector: Connector =
            Arc::new(|_| Err(ProbeError::Privilege("operation not permitted".to_string())));
        let registry = Registry::with_connector(config_rx, journal, connector);

        assert!(matches!(
            registry.add("router", "10.0.0.1").await,
            Err(MonitorError::Probe(ProbeError::Privilege(_)))
        ));
        assert!(registry.snapshots().await.is_empty());
    }
}
