//! Seam to the underlying secure-session library.
//!
//! The harness never implements a handshake. It only asks a library for
//! session handles and pushes them one non-blocking step at a time. A
//! library is a pair of contexts (client and server) plus the thread-safety
//! contract: how many lock identifiers it needs, what they are called, and
//! the [`Hooks`] slot through which it reaches the installed callback.

use std::fmt;

use crate::{
    error::SessionError, hooks::Hooks, pipe::Link, stats::ContextStats,
};

/// Side of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Initiates the handshake.
    Client,
    /// Accepts the handshake.
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Server => f.write_str("server"),
        }
    }
}

/// What a blocked step is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Want {
    /// Bytes from the peer.
    Read,
    /// Room in the outbound pipe.
    Write,
}

/// Result of one non-blocking library step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Application bytes written or read.
    Transferred(usize),
    /// The session cannot proceed until the peer makes progress.
    Blocked(Want),
    /// The peer closed the session in an orderly way.
    Closed,
}

/// Identity of a library session handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One library session handle.
///
/// A handle can carry several consecutive connections: [`Session::begin`]
/// starts a new one, resuming the previous session when the library
/// supports it.
pub trait Session: Send {
    /// Identity of this handle.
    fn handle(&self) -> HandleId;

    /// Role this handle was created for.
    fn role(&self) -> Role;

    /// Start a new connection on this handle.
    fn begin(&mut self) -> Result<(), SessionError>;

    /// Advance the handshake, then send `payload` once established.
    fn write(&mut self, link: &mut Link<'_>, payload: &[u8]) -> Result<Step, SessionError>;

    /// Advance the handshake, then receive into `buf` once established.
    fn read(&mut self, link: &mut Link<'_>, buf: &mut [u8]) -> Result<Step, SessionError>;

    /// Decrypted bytes already buffered inside the session.
    fn pending(&self) -> usize;

    /// Whether the session holds outbound bytes that have not reached the
    /// pipe yet.
    ///
    /// Sessions that write straight into the pipe never do.
    fn wants_write(&self) -> bool {
        false
    }

    /// Move held outbound bytes into the pipe without advancing the
    /// connection. Returns the number of bytes moved.
    fn flush(&mut self, _link: &mut Link<'_>) -> Result<usize, SessionError> {
        Ok(0)
    }

    /// Whether the handshake is still in progress.
    fn is_handshaking(&self) -> bool;

    /// Short description of the handshake state, for diagnostics.
    fn state(&self) -> &'static str;

    /// Mark the current connection finished without further I/O.
    fn shutdown(&mut self);
}

/// Factory for sessions of one role, with shared statistics.
pub trait SessionContext: Send + Sync {
    /// Session handle type.
    type Session: Session;

    /// Role of every session this context creates.
    fn role(&self) -> Role;

    /// Allocate a new session handle.
    fn new_session(&self) -> Result<Self::Session, SessionError>;

    /// Snapshot of the context's counters.
    fn stats(&self) -> ContextStats;
}

/// A secure-session library ready to be driven from many threads.
pub trait SessionLibrary: Send + Sync + 'static {
    /// Context type shared by both roles.
    type Context: SessionContext;

    /// Number of lock identifiers the library uses.
    fn lock_count(&self) -> usize;

    /// Human-readable name of lock `id`.
    fn lock_name(&self, id: usize) -> &'static str;

    /// Slot the library consults for its locking callback.
    fn hooks(&self) -> &Hooks;

    /// Context creating client sessions.
    fn client(&self) -> &Self::Context;

    /// Context creating server sessions.
    fn server(&self) -> &Self::Context;

    /// Error messages the library recorded for the calling thread.
    fn drain_errors(&self) -> Vec<String>;
}
