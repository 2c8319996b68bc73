// src/connection.rs
//
// Link lifecycle and peer relationship. A single `Mutex<ConnState>` plus a
// `Condvar` broadcasts every transition to waiters, the same wait-set shape
// `pubsub::Bus` uses for its ring cursor (`cv.notify_all()` paired with
// `cv.wait()`), just guarding a state enum instead of a byte ring.

use std::sync::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Standalone,
    Unconnected,
    WFConnection,
    WFReportParams,
    Connected,
    SyncingAll,
    SyncingQuick,
    SyncSource,
    SyncTarget,
    Timeout,
    BrokenPipe,
    NetworkFailure,
}

impl ConnState {
    /// Terminal-ish failure states that trigger a controlled teardown:
    /// worker stop, socket close, TL clear, and a return to `Unconnected`.
    pub fn is_failure(self) -> bool {
        matches!(self, ConnState::Timeout | ConnState::BrokenPipe | ConnState::NetworkFailure)
    }

    pub fn is_syncing(self) -> bool {
        matches!(
            self,
            ConnState::SyncingAll | ConnState::SyncingQuick | ConnState::SyncSource | ConnState::SyncTarget
        )
    }

    /// Label used for the `connection_state` gauge vector; kept alongside the
    /// enum so a new variant can't drift out of sync with the exported metric.
    pub fn metric_label(self) -> &'static str {
        match self {
            ConnState::Standalone => "standalone",
            ConnState::Unconnected => "unconnected",
            ConnState::WFConnection => "wf_connection",
            ConnState::WFReportParams => "wf_report_params",
            ConnState::Connected => "connected",
            ConnState::SyncingAll => "syncing_all",
            ConnState::SyncingQuick => "syncing_quick",
            ConnState::SyncSource => "sync_source",
            ConnState::SyncTarget => "sync_target",
            ConnState::Timeout => "timeout",
            ConnState::BrokenPipe => "broken_pipe",
            ConnState::NetworkFailure => "network_failure",
        }
    }
}

pub const METRIC_LABELS: [&str; 12] = [
    "standalone",
    "unconnected",
    "wf_connection",
    "wf_report_params",
    "connected",
    "syncing_all",
    "syncing_quick",
    "sync_source",
    "sync_target",
    "timeout",
    "broken_pipe",
    "network_failure",
];

pub struct ConnectionState {
    state: Mutex<ConnState>,
    cv: Condvar,
}

impl ConnectionState {
    pub fn new(initial: ConnState) -> Self {
        Self { state: Mutex::new(initial), cv: Condvar::new() }
    }

    pub fn get(&self) -> ConnState {
        *self.state.lock().unwrap()
    }

    /// The single setter every transition goes through; wakes all waiters
    /// regardless of what they are waiting for; predicates just re-check.
    pub fn set(&self, new_state: ConnState) {
        let mut guard = self.state.lock().unwrap();
        *guard = new_state;
        drop(guard);
        self.cv.notify_all();
    }

    pub fn wait_until(&self, mut predicate: impl FnMut(ConnState) -> bool) -> ConnState {
        let guard = self.state.lock().unwrap();
        let guard = self.cv.wait_while(guard, |s| !predicate(*s)).unwrap();
        *guard
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new(ConnState::Standalone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn set_then_get_observes_transition() {
        let cs = ConnectionState::default();
        assert_eq!(cs.get(), ConnState::Standalone);
        cs.set(ConnState::WFConnection);
        assert_eq!(cs.get(), ConnState::WFConnection);
    }

    #[test]
    fn wait_until_unblocks_on_matching_transition() {
        let cs = Arc::new(ConnectionState::default());
        let cs2 = cs.clone();
        let handle = thread::spawn(move || cs2.wait_until(|s| s == ConnState::Connected));
        thread::sleep(Duration::from_millis(20));
        cs.set(ConnState::WFReportParams);
        cs.set(ConnState::Connected);
        assert_eq!(handle.join().unwrap(), ConnState::Connected);
    }

    #[test]
    fn failure_states_are_identified() {
        assert!(ConnState::Timeout.is_failure());
        assert!(ConnState::BrokenPipe.is_failure());
        assert!(!ConnState::Connected.is_failure());
    }
}
