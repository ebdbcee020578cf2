//! Online/offline connectivity detector.
//!
//! Observes the outcome of every remote call plus periodic probes and
//! derives one of three states from a sliding window of recent transport
//! outcomes. While `Offline`, the upload workers park and the delta
//! applier stops polling (enqueueing continues); the first success flips
//! straight back to `Online`, upon which uploads drain and a delta poll
//! fires immediately.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use cirrus_core::domain::CoreError;
use cirrus_core::ports::{Reachability, RemoteDrive};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Size of the sliding outcome window.
const WINDOW: usize = 8;

/// Consecutive transport failures before leaving `Online`.
const DEGRADED_THRESHOLD: usize = 2;

/// Consecutive transport failures before declaring `Offline`.
const OFFLINE_THRESHOLD: usize = 4;

/// Probe cadence while not fully online.
const PROBE_INTERVAL: Duration = Duration::from_secs(15);

/// Connectivity as seen by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    /// Calls are succeeding
    Online,
    /// Recent transport failures; traffic continues, probes start
    Degraded,
    /// The remote is unreachable; workers pause
    Offline,
}

struct DetectorState {
    /// Recent call outcomes, true = success, newest at the back
    window: VecDeque<bool>,
    state: NetworkState,
}

/// The offline detector.
pub struct ConnectivityMonitor {
    inner: Mutex<DetectorState>,
    tx: watch::Sender<NetworkState>,
}

impl ConnectivityMonitor {
    /// Creates a monitor starting in `Online`.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(NetworkState::Online);
        Self {
            inner: Mutex::new(DetectorState {
                window: VecDeque::with_capacity(WINDOW),
                state: NetworkState::Online,
            }),
            tx,
        }
    }

    /// Current state.
    pub fn state(&self) -> NetworkState {
        self.inner.lock().unwrap().state
    }

    /// True while fully offline.
    pub fn is_offline(&self) -> bool {
        self.state() == NetworkState::Offline
    }

    /// Subscribes to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.tx.subscribe()
    }

    /// Feeds the outcome of a remote call into the window. Only transport
    /// classes count: HTTP-level errors (404, 412, …) prove the wire works
    /// and count as successes.
    pub fn record_result<T>(&self, result: &Result<T, CoreError>) {
        match result {
            Err(CoreError::Transient(_)) => self.record(false),
            Err(CoreError::NotConnected) => self.record(false),
            _ => self.record(true),
        }
    }

    /// Records a raw outcome.
    pub fn record(&self, success: bool) {
        let mut inner = self.inner.lock().unwrap();
        if inner.window.len() == WINDOW {
            inner.window.pop_front();
        }
        inner.window.push_back(success);

        let next = if success {
            // first successful call flips straight back
            NetworkState::Online
        } else {
            let consecutive_failures = inner
                .window
                .iter()
                .rev()
                .take_while(|ok| !**ok)
                .count();
            if consecutive_failures >= OFFLINE_THRESHOLD {
                NetworkState::Offline
            } else if consecutive_failures >= DEGRADED_THRESHOLD {
                NetworkState::Degraded
            } else {
                inner.state
            }
        };

        if next != inner.state {
            info!(from = ?inner.state, to = ?next, "connectivity transition");
            inner.state = next;
            let _ = self.tx.send(next);
        }
    }

    /// Records an explicit probe outcome. A failed probe forces `Offline`
    /// regardless of window contents.
    pub fn record_probe(&self, reachable: bool) {
        if reachable {
            self.record(true);
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.window.len() == WINDOW {
            inner.window.pop_front();
        }
        inner.window.push_back(false);
        if inner.state != NetworkState::Offline {
            info!(from = ?inner.state, "probe failed, going offline");
            inner.state = NetworkState::Offline;
            let _ = self.tx.send(NetworkState::Offline);
        }
    }

    /// Blocks until the state is not `Offline`. Returns immediately when
    /// already online or degraded.
    pub async fn wait_until_connected(&self) {
        let mut rx = self.subscribe();
        loop {
            if self.state() != NetworkState::Offline {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Probe loop: while the state is not `Online`, probes the remote at a
    /// fixed cadence so recovery is noticed without user traffic. Runs
    /// until `shutdown` fires.
    pub async fn run_probes(&self, remote: &dyn RemoteDrive, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(PROBE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("probe loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if self.state() == NetworkState::Online {
                        continue;
                    }
                    let reachable = matches!(remote.probe().await, Reachability::Reachable);
                    debug!(reachable, "connectivity probe");
                    self.record_probe(reachable);
                }
            }
        }
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_online() {
        let monitor = ConnectivityMonitor::new();
        assert_eq!(monitor.state(), NetworkState::Online);
        assert!(!monitor.is_offline());
    }

    #[test]
    fn test_two_consecutive_failures_degrade() {
        let monitor = ConnectivityMonitor::new();
        monitor.record(false);
        assert_eq!(monitor.state(), NetworkState::Online);
        monitor.record(false);
        assert_eq!(monitor.state(), NetworkState::Degraded);
    }

    #[test]
    fn test_continued_failure_goes_offline() {
        let monitor = ConnectivityMonitor::new();
        for _ in 0..4 {
            monitor.record(false);
        }
        assert_eq!(monitor.state(), NetworkState::Offline);
    }

    #[test]
    fn test_first_success_restores_online() {
        let monitor = ConnectivityMonitor::new();
        for _ in 0..6 {
            monitor.record(false);
        }
        assert_eq!(monitor.state(), NetworkState::Offline);

        monitor.record(true);
        assert_eq!(monitor.state(), NetworkState::Online);
    }

    #[test]
    fn test_interleaved_failures_do_not_degrade() {
        let monitor = ConnectivityMonitor::new();
        for _ in 0..4 {
            monitor.record(false);
            monitor.record(true);
        }
        assert_eq!(monitor.state(), NetworkState::Online);
    }

    #[test]
    fn test_probe_failure_forces_offline() {
        let monitor = ConnectivityMonitor::new();
        assert_eq!(monitor.state(), NetworkState::Online);
        monitor.record_probe(false);
        assert_eq!(monitor.state(), NetworkState::Offline);

        monitor.record_probe(true);
        assert_eq!(monitor.state(), NetworkState::Online);
    }

    #[test]
    fn test_http_level_errors_count_as_wire_success() {
        let monitor = ConnectivityMonitor::new();
        monitor.record(false);
        let not_found: Result<(), CoreError> = Err(CoreError::NotFound("x".into()));
        monitor.record_result(&not_found);
        // 404 proves the remote answered
        assert_eq!(monitor.state(), NetworkState::Online);
    }

    #[test]
    fn test_transport_errors_count_as_failures() {
        let monitor = ConnectivityMonitor::new();
        let transport: Result<(), CoreError> = Err(CoreError::Transient("dns".into()));
        monitor.record_result(&transport);
        monitor.record_result(&transport);
        assert_eq!(monitor.state(), NetworkState::Degraded);
    }

    #[tokio::test]
    async fn test_wait_until_connected_returns_when_online() {
        let monitor = ConnectivityMonitor::new();
        // already online: returns immediately
        monitor.wait_until_connected().await;
    }

    #[tokio::test]
    async fn test_wait_until_connected_wakes_on_transition() {
        use std::sync::Arc;

        let monitor = Arc::new(ConnectivityMonitor::new());
        for _ in 0..4 {
            monitor.record(false);
        }
        assert!(monitor.is_offline());

        let waiter = Arc::clone(&monitor);
        let task = tokio::spawn(async move { waiter.wait_until_connected().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        monitor.record(true);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[test]
    fn test_watch_broadcasts_transitions() {
        let monitor = ConnectivityMonitor::new();
        let rx = monitor.subscribe();
        monitor.record(false);
        monitor.record(false);
        assert_eq!(*rx.borrow(), NetworkState::Degraded);
    }
}
