// src/error.rs
use std::fmt;
use std::io;

/// Closed set of failure kinds for the replication core.
///
/// Mirrors the kinds named by the protocol design: timeouts and broken
/// sockets roll the connection state machine into a failure state, a
/// protocol violation is fatal to the connection, backing-store errors
/// mark the device inconsistent, and `OutOfBuffers` is the only variant
/// callers are expected to retry after rather than give up on.
#[derive(Debug)]
pub enum DrbdError {
    PeerTimeout,
    BrokenPipe,
    ProtocolViolation { detail: String },
    BackingIo(io::Error),
    OutOfBuffers,
    StateRefused { detail: String },
}

impl fmt::Display for DrbdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrbdError::PeerTimeout => write!(f, "peer ack timed out"),
            DrbdError::BrokenPipe => write!(f, "connection to peer broken"),
            DrbdError::ProtocolViolation { detail } => write!(f, "protocol violation: {detail}"),
            DrbdError::BackingIo(e) => write!(f, "backing store i/o error: {e}"),
            DrbdError::OutOfBuffers => write!(f, "epoch entry pool exhausted"),
            DrbdError::StateRefused { detail } => write!(f, "state transition refused: {detail}"),
        }
    }
}

impl std::error::Error for DrbdError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DrbdError::BackingIo(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DrbdError {
    fn from(e: io::Error) -> Self {
        DrbdError::BackingIo(e)
    }
}

impl DrbdError {
    #[inline]
    pub fn protocol<S: Into<String>>(detail: S) -> Self {
        DrbdError::ProtocolViolation { detail: detail.into() }
    }

    #[inline]
    pub fn state_refused<S: Into<String>>(detail: S) -> Self {
        DrbdError::StateRefused { detail: detail.into() }
    }

    /// Whether a node configured with `do_panic` should abort rather than
    /// merely disconnect. Only protocol violations can no longer guarantee
    /// data integrity; everything else is recoverable via reconnect/resync.
    #[inline]
    pub fn is_integrity_fatal(&self) -> bool {
        matches!(self, DrbdError::ProtocolViolation { .. })
    }
}

pub type Result<T> = std::result::Result<T, DrbdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_detail() {
        let e = DrbdError::protocol("bad magic");
        assert_eq!(e.to_string(), "protocol violation: bad magic");
    }

    #[test]
    fn only_protocol_violation_is_integrity_fatal() {
        assert!(DrbdError::protocol("x").is_integrity_fatal());
        assert!(!DrbdError::PeerTimeout.is_integrity_fatal());
        assert!(!DrbdError::OutOfBuffers.is_integrity_fatal());
    }

    #[test]
    fn io_error_converts() {
        let io_err = io::Error::new(io::ErrorKind::Other, "disk gone");
        let e: DrbdError = io_err.into();
        assert!(matches!(e, DrbdError::BackingIo(_)));
    }
}
