//! Error taxonomy for upgraded streams.
//!
//! Three families reach callers:
//!
//! - **Transport failures** ([`TransportError`]): the connection broke or an
//!   operation timed out. The first one seen on a direction is latched and
//!   re-raised by every later call on that direction.
//! - **State violations** ([`StateViolation`]): the caller broke the usage
//!   contract (double listener registration, read before readiness, write
//!   after close). Raised synchronously, engine state untouched.
//! - **Cancellation**: produced only by close-driven cancellation and never
//!   handed to a listener as a failure.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Which half of the duplex stream an operation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}

/// Failure reported by a transport backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("{op} timed out after {after:?}")]
    Timeout { op: Direction, after: Duration },

    #[error("{op} failed: {source}")]
    Io {
        op: Direction,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("transport closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn io(op: Direction, err: io::Error) -> Self {
        TransportError::Io {
            op,
            source: Arc::new(err),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }
}

/// Caller-contract violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StateViolation {
    #[error("a listener is already registered for this direction")]
    ListenerAlreadySet,

    #[error("stream is not ready; wait for the listener callback")]
    NotReady,

    #[error("a read is already outstanding")]
    ReadOutstanding,

    #[error("a write is already queued behind an outstanding flush")]
    WriteOutstanding,

    #[error("stream is closed")]
    Closed,
}

/// Error surfaced by the input and output engines.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Transport(TransportError),

    #[error("invalid stream state: {0}")]
    State(#[from] StateViolation),

    #[error("operation cancelled by close")]
    Cancelled,
}

impl From<TransportError> for StreamError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Cancelled => StreamError::Cancelled,
            other => StreamError::Transport(other),
        }
    }
}

impl StreamError {
    pub fn is_state(&self, violation: StateViolation) -> bool {
        matches!(self, StreamError::State(v) if *v == violation)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StreamError::Transport(e) if e.is_timeout())
    }
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        let kind = match &err {
            StreamError::Transport(TransportError::Timeout { .. }) => io::ErrorKind::TimedOut,
            StreamError::Transport(TransportError::Io { source, .. }) => source.kind(),
            StreamError::Transport(TransportError::Closed) => io::ErrorKind::NotConnected,
            StreamError::Transport(TransportError::Cancelled) | StreamError::Cancelled => {
                io::ErrorKind::Interrupted
            }
            StreamError::State(StateViolation::NotReady) => io::ErrorKind::WouldBlock,
            StreamError::State(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
