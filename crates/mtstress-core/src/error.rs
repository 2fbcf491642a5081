//! Error types for the stress harness.
//!
//! Would-block is deliberately absent: it is a scheduling signal carried by
//! [`crate::Step`] and [`crate::StepOutcome`], never an error.

use std::io;

use thiserror::Error;

use crate::{exchange::Phase, session::Role};

/// Misuse of the lock registry or of the library's callback slot.
///
/// Reaching any of these through the locking callback means the library and
/// the harness disagree about lock ownership; the callback aborts the
/// process instead of returning them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// Lock identifier outside the registry.
    #[error("lock id {id} out of range (registry has {count} locks)")]
    OutOfRange {
        /// Requested identifier
        id: usize,
        /// Number of locks in the registry
        count: usize,
    },

    /// Release by a thread that does not hold the lock.
    #[error("lock {id} released by a thread that does not hold it")]
    NotHeld {
        /// Lock identifier
        id: usize,
    },

    /// Second acquire of a non-recursive lock by its holder.
    #[error("lock {id} acquired twice by the same thread")]
    AlreadyHeld {
        /// Lock identifier
        id: usize,
    },

    /// A locking callback is already installed in this library.
    #[error("a locking callback is already installed")]
    AlreadyInstalled,

    /// Teardown while other owners still reference the registry.
    #[error("registry still referenced by {holders} other owner(s)")]
    InUse {
        /// Number of outstanding references
        holders: usize,
    },

    /// Teardown while a lock is held.
    #[error("lock {id} still held at teardown")]
    StillHeld {
        /// Lock identifier
        id: usize,
    },
}

/// Failure reported by the underlying session library.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The library rejected the handshake or a data operation.
    #[error("protocol failure: {0}")]
    Protocol(String),

    /// A step was attempted before the session was started.
    #[error("session not started")]
    NotStarted,

    /// The library could not create or start the session.
    #[error("session setup failed: {0}")]
    Setup(String),
}

/// Unrecoverable failure of one endpoint step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    /// The library reported an error; the step is not retried.
    #[error("{role} endpoint failed: {source}")]
    Fatal {
        /// Endpoint role
        role: Role,
        /// Library error
        #[source]
        source: SessionError,
    },

    /// The library reported an orderly close before the exchange finished.
    #[error("{role} endpoint closed during startup")]
    StartupFailed {
        /// Endpoint role
        role: Role,
    },
}

impl EndpointError {
    /// Role of the endpoint that failed.
    pub fn role(&self) -> Role {
        match self {
            Self::Fatal { role, .. } | Self::StartupFailed { role } => *role,
        }
    }
}

/// Failure of one connection attempt inside the exchange loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    /// An endpoint step failed.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    /// Neither side can make progress and no bytes are in flight.
    #[error("startup deadlock after {rounds} round(s): client {client:?}, server {server:?}")]
    StartupDeadlock {
        /// Rounds executed before the deadlock was detected
        rounds: usize,
        /// Client phase at detection
        client: Phase,
        /// Server phase at detection
        server: Phase,
    },

    /// A side received something other than its peer's message.
    #[error("{role} received {received:?}, expected {expected:?}")]
    PayloadMismatch {
        /// Receiving side
        role: Role,
        /// Peer message
        expected: Vec<u8>,
        /// Bytes actually received
        received: Vec<u8>,
    },

    /// A side was given nothing to send.
    #[error("{role} greeting is empty")]
    EmptyMessage {
        /// Side whose greeting is empty
        role: Role,
    },

    /// An endpoint was placed on the wrong side of the exchange.
    #[error("expected a {expected} endpoint, got {found}")]
    RoleMismatch {
        /// Role required by the slot
        expected: Role,
        /// Role of the supplied endpoint
        found: Role,
    },
}

/// Failure of one iteration of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptError {
    /// The library could not allocate a session handle.
    #[error("{role} session allocation failed: {source}")]
    Allocation {
        /// Role of the context
        role: Role,
        /// Library error
        #[source]
        source: SessionError,
    },

    /// Starting an endpoint failed.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    /// The exchange loop failed.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

/// Failure to start a worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The lock registry could not be installed.
    #[error("cannot install lock registry: {0}")]
    Install(#[from] LockError),

    /// The OS refused to create a worker thread.
    #[error("cannot spawn worker {worker}: {source}")]
    Spawn {
        /// Index of the worker that failed to start
        worker: usize,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}
