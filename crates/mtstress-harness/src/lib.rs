//! Deterministic simulated session library for stress-harness testing.
//!
//! [`SimLibrary`] stands in for a real secure-session library: it runs a
//! scripted handshake over framed [`record`]s, keeps a session-id cache for
//! resumption, and routes every access to its shared tables through the
//! installed locking callback. Faults can be injected to drive the exchange
//! loop's failure paths, and a journal records which thread touched which
//! session handle.

#![forbid(unsafe_code)]

pub mod record;
pub mod sim_library;

pub use record::{Record, RecordError, RecordKind};
pub use sim_library::{
    DEFAULT_CACHE_CAPACITY, Faults, Journal, JournalEntry, JournalEvent, SimContext, SimLibrary,
    SimLock, SimSession,
};
