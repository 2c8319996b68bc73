// src/worker.rs
//
// Shared run-state for the three cooperating workers (Receiver, DiskSender,
// AckSender). Stop is cooperative: a signal is posted here, each worker
// observes it at its next I/O boundary (a read timeout, a channel recv
// timeout) and exits, mirroring the `BarrierFlag` the teacher's `rx_loop`
// polls between packets.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Exiting,
    Restarting,
}

impl RunState {
    fn from_u8(v: u8) -> RunState {
        match v {
            0 => RunState::Running,
            1 => RunState::Exiting,
            _ => RunState::Restarting,
        }
    }
}

pub struct WorkerSignal(AtomicU8);

impl Default for WorkerSignal {
    fn default() -> Self {
        Self(AtomicU8::new(RunState::Running as u8))
    }
}

impl WorkerSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn request_exit(&self) {
        self.0.store(RunState::Exiting as u8, Ordering::SeqCst);
    }

    pub fn request_restart(&self) {
        self.0.store(RunState::Restarting as u8, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(RunState::Running as u8, Ordering::SeqCst);
    }

    pub fn should_stop(&self) -> bool {
        self.state() != RunState::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_signal_runs_until_told_otherwise() {
        let sig = WorkerSignal::new();
        assert_eq!(sig.state(), RunState::Running);
        assert!(!sig.should_stop());
        sig.request_exit();
        assert!(sig.should_stop());
        assert_eq!(sig.state(), RunState::Exiting);
    }

    #[test]
    fn restart_is_also_a_stop_signal() {
        let sig = WorkerSignal::new();
        sig.request_restart();
        assert!(sig.should_stop());
        assert_eq!(sig.state(), RunState::Restarting);
        sig.clear();
        assert!(!sig.should_stop());
    }
}
