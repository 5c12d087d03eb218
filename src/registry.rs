//! Worker and observer registry
//!
//! Tracks every registered worker with its last report, the transport peers
//! they arrived on, and the observer sessions (one controller, many viewers).
//!
//! # Observer roles
//!
//! - The first admitted session becomes the **controller**, the only one
//!   allowed to issue commands.
//! - Later sessions are **viewers** and only receive broadcasts.
//! - When the controller leaves, every viewer is evicted as well.

use crate::protocol::WorkerReport;
use crate::transport::PeerId;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::mpsc;

/// Outbound channel to one observer (JSON text messages)
pub type ObserverChannel = mpsc::UnboundedSender<String>;

/// Worker connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Connected,
    Lost,
}

/// One registered worker
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerRecord {
    pub id: String,
    pub status: WorkerStatus,
    /// Most recent report, replayed to late-joining observers
    pub last_report: WorkerReport,
    /// Transport peer the worker registered through
    pub peer: Option<PeerId>,
}

/// Observer role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverRole {
    Controller,
    Viewer,
}

/// One connected observer
#[derive(Debug, Clone)]
pub struct ObserverSession {
    pub role: ObserverRole,
    pub address: String,
    pub channel: ObserverChannel,
}

/// Registry of workers and observer sessions
#[derive(Debug, Default)]
pub struct Registry {
    /// Workers by id (ordered for deterministic replay)
    workers: BTreeMap<String, WorkerRecord>,

    /// Transport peers currently connected
    peers: HashSet<PeerId>,

    controller: Option<ObserverSession>,
    viewers: Vec<ObserverSession>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Transport peers ---------------------------------------------------

    /// Note a new transport connection
    pub fn peer_connected(&mut self, peer: PeerId) {
        self.peers.insert(peer);
    }

    /// Number of live transport connections
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Drop a transport connection and every worker registered through it
    ///
    /// Returns the removed records (status set to `Lost`). Unknown peers are a no-op.
    pub fn on_transport_disconnect(&mut self, peer: PeerId) -> Vec<WorkerRecord> {
        self.peers.remove(&peer);

        let ids: Vec<String> = self
            .workers
            .values()
            .filter(|r| r.peer == Some(peer))
            .map(|r| r.id.clone())
            .collect();

        ids.iter()
            .filter_map(|id| self.remove_worker(id))
            .collect()
    }

    // --- Workers -----------------------------------------------------------

    /// Insert or refresh a worker from a `workerConnected` report
    ///
    /// Re-registering an id keeps a single record holding the latest report.
    /// Reports of any other kind are ignored.
    pub fn register_worker(&mut self, report: &WorkerReport, peer: Option<PeerId>) -> Option<&WorkerRecord> {
        let WorkerReport::WorkerConnected { worker } = report else {
            return None;
        };

        let record = WorkerRecord {
            id: worker.clone(),
            status: WorkerStatus::Connected,
            last_report: report.clone(),
            peer,
        };
        self.workers.insert(worker.clone(), record);
        self.workers.get(worker)
    }

    /// Remove the worker named by a `workerLost` report
    pub fn unregister_worker(&mut self, report: &WorkerReport) -> Option<WorkerRecord> {
        match report {
            WorkerReport::WorkerLost { worker } => self.remove_worker(worker),
            _ => None,
        }
    }

    fn remove_worker(&mut self, id: &str) -> Option<WorkerRecord> {
        self.workers.remove(id).map(|mut record| {
            record.status = WorkerStatus::Lost;
            record
        })
    }

    /// Look up one worker
    pub fn worker(&self, id: &str) -> Option<&WorkerRecord> {
        self.workers.get(id)
    }

    /// Number of registered workers
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Last report of every registered worker, for replay to a new observer
    pub fn snapshot_all(&self) -> Vec<WorkerReport> {
        self.workers.values().map(|r| r.last_report.clone()).collect()
    }

    // --- Observers ---------------------------------------------------------

    /// Admit an observer session
    ///
    /// The first admission becomes the controller; later ones become viewers.
    /// An address that is already admitted is not added twice. Returns the
    /// role the address holds afterwards.
    pub fn admit_observer(&mut self, address: &str, channel: ObserverChannel) -> ObserverRole {
        if self.is_controller(address) {
            return ObserverRole::Controller;
        }

        if self.controller.is_none() {
            log::info!("Observer {} is the controller", address);
            self.controller = Some(ObserverSession {
                role: ObserverRole::Controller,
                address: address.to_string(),
                channel,
            });
            return ObserverRole::Controller;
        }

        if !self.viewers.iter().any(|v| v.address == address) {
            log::info!("Observer {} joined as viewer", address);
            self.viewers.push(ObserverSession {
                role: ObserverRole::Viewer,
                address: address.to_string(),
                channel,
            });
        }
        ObserverRole::Viewer
    }

    /// Remove an observer session
    ///
    /// Removing the controller clears every viewer too. Returns the number of
    /// sessions removed.
    pub fn evict_observer(&mut self, address: &str) -> usize {
        if self.is_controller(address) {
            let removed = 1 + self.viewers.len();
            log::info!("Controller {} left, clearing all {} observer sessions", address, removed);
            self.controller = None;
            self.viewers.clear();
            return removed;
        }

        let before = self.viewers.len();
        self.viewers.retain(|v| v.address != address);
        before - self.viewers.len()
    }

    /// Whether `address` holds the controller role
    pub fn is_controller(&self, address: &str) -> bool {
        self.controller.as_ref().is_some_and(|c| c.address == address)
    }

    /// Whether a session from `address` may submit commands
    ///
    /// Only the controller may, except that anyone may while no controller exists.
    pub fn may_command(&self, address: &str) -> bool {
        match &self.controller {
            Some(controller) => controller.address == address,
            None => true,
        }
    }

    pub fn controller(&self) -> Option<&ObserverSession> {
        self.controller.as_ref()
    }

    pub fn viewers(&self) -> &[ObserverSession] {
        &self.viewers
    }

    pub fn observer_count(&self) -> usize {
        self.viewers.len() + usize::from(self.controller.is_some())
    }

    /// Send a text message to one observer
    pub fn send_to_observer(&self, address: &str, text: &str) {
        let session = self
            .controller
            .iter()
            .chain(self.viewers.iter())
            .find(|s| s.address == address);
        if let Some(session) = session {
            if session.channel.send(text.to_string()).is_err() {
                log::debug!("Observer {} channel closed", address);
            }
        }
    }

    /// Send a text message to the controller and every viewer
    ///
    /// Returns the number of sessions it was queued for.
    pub fn broadcast_to_observers(&self, text: &str) -> usize {
        let mut delivered = 0;
        for session in self.controller.iter().chain(self.viewers.iter()) {
            log::trace!("Send to {:?} {}: {}", session.role, session.address, text);
            if session.channel.send(text.to_string()).is_ok() {
                delivered += 1;
            } else {
                log::debug!("Observer {} channel closed", session.address);
            }
        }
        delivered
    }

    /// Forget all workers, peers and observer sessions
    pub fn clear(&mut self) {
        self.workers.clear();
        self.peers.clear();
        self.controller = None;
        self.viewers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connected(id: &str) -> WorkerReport {
        WorkerReport::WorkerConnected { worker: id.to_string() }
    }

    fn channel() -> (ObserverChannel, mpsc::UnboundedReceiver<String>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_reregistration_keeps_one_record() {
        let mut registry = Registry::new();
        registry.register_worker(&connected("w1"), Some(1));
        registry.register_worker(&connected("w1"), Some(2));

        assert_eq!(registry.worker_count(), 1);
        let record = registry.worker("w1").unwrap();
        assert_eq!(record.peer, Some(2));
        assert_eq!(record.status, WorkerStatus::Connected);
    }

    #[test]
    fn test_register_ignores_other_reports() {
        let mut registry = Registry::new();
        let stats = WorkerReport::Statistics { result: json!({}) };
        assert!(registry.register_worker(&stats, None).is_none());
        assert_eq!(registry.worker_count(), 0);
    }

    #[test]
    fn test_unregister_absent_is_noop() {
        let mut registry = Registry::new();
        let lost = WorkerReport::WorkerLost { worker: "ghost".to_string() };
        assert!(registry.unregister_worker(&lost).is_none());

        registry.register_worker(&connected("w1"), None);
        let removed = registry.unregister_worker(&WorkerReport::WorkerLost { worker: "w1".to_string() });
        assert_eq!(removed.unwrap().status, WorkerStatus::Lost);
        assert_eq!(registry.worker_count(), 0);
    }

    #[test]
    fn test_transport_disconnect_removes_peer_workers() {
        let mut registry = Registry::new();
        registry.peer_connected(1);
        registry.peer_connected(2);
        registry.register_worker(&connected("gpu-0"), Some(1));
        registry.register_worker(&connected("gpu-1"), Some(1));
        registry.register_worker(&connected("cpu-0"), Some(2));

        let removed = registry.on_transport_disconnect(1);
        let mut ids: Vec<String> = removed.into_iter().map(|r| r.id).collect();
        ids.sort();

        assert_eq!(ids, vec!["gpu-0", "gpu-1"]);
        assert_eq!(registry.worker_count(), 1);
        assert_eq!(registry.peer_count(), 1);
        assert!(registry.on_transport_disconnect(99).is_empty());
    }

    #[test]
    fn test_snapshot_replays_last_reports() {
        let mut registry = Registry::new();
        registry.register_worker(&connected("b"), None);
        registry.register_worker(&connected("a"), None);

        assert_eq!(registry.snapshot_all(), vec![connected("a"), connected("b")]);
    }

    #[test]
    fn test_first_observer_is_controller() {
        let mut registry = Registry::new();
        let (c1, _r1) = channel();
        let (c2, _r2) = channel();
        let (c3, _r3) = channel();

        assert_eq!(registry.admit_observer("10.0.0.1:5000", c1), ObserverRole::Controller);
        assert_eq!(registry.admit_observer("10.0.0.2:5000", c2.clone()), ObserverRole::Viewer);
        assert_eq!(registry.admit_observer("10.0.0.2:5000", c2), ObserverRole::Viewer);
        assert_eq!(registry.admit_observer("10.0.0.3:5000", c3), ObserverRole::Viewer);

        assert!(registry.is_controller("10.0.0.1:5000"));
        assert_eq!(registry.viewers().len(), 2);
        assert_eq!(registry.observer_count(), 3);
    }

    #[test]
    fn test_controller_uniqueness_over_many_admissions() {
        let mut registry = Registry::new();
        let mut receivers = Vec::new();
        for i in 0..20 {
            let (tx, rx) = channel();
            receivers.push(rx);
            registry.admit_observer(&format!("peer-{}", i % 7), tx);

            let controllers = usize::from(registry.controller().is_some())
                + registry
                    .viewers()
                    .iter()
                    .filter(|v| v.role == ObserverRole::Controller)
                    .count();
            assert_eq!(controllers, 1);
            assert!(registry.is_controller("peer-0"));
        }
    }

    #[test]
    fn test_controller_loss_clears_viewers() {
        let mut registry = Registry::new();
        for i in 0..5 {
            let (tx, _rx) = channel();
            registry.admit_observer(&format!("peer-{}", i), tx);
        }

        assert_eq!(registry.evict_observer("peer-3"), 1);
        assert_eq!(registry.viewers().len(), 3);

        assert_eq!(registry.evict_observer("peer-0"), 4);
        assert_eq!(registry.observer_count(), 0);
        assert!(registry.controller().is_none());

        // Next admission becomes controller again
        let (tx, _rx) = channel();
        assert_eq!(registry.admit_observer("peer-4", tx), ObserverRole::Controller);
    }

    #[test]
    fn test_may_command() {
        let mut registry = Registry::new();
        assert!(registry.may_command("anyone"));

        let (tx, _rx) = channel();
        registry.admit_observer("ctl", tx);
        let (tx, _rx2) = channel();
        registry.admit_observer("view", tx);

        assert!(registry.may_command("ctl"));
        assert!(!registry.may_command("view"));
    }

    #[test]
    fn test_broadcast_reaches_all_sessions() {
        let mut registry = Registry::new();
        let (c, mut rc) = channel();
        let (v, mut rv) = channel();
        registry.admit_observer("ctl", c);
        registry.admit_observer("view", v);

        assert_eq!(registry.broadcast_to_observers("hello"), 2);
        assert_eq!(rc.try_recv().unwrap(), "hello");
        assert_eq!(rv.try_recv().unwrap(), "hello");
    }
}
