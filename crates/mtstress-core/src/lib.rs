//! Core of the multi-threaded session stress harness.
//!
//! A secure-session library is driven from many OS threads at once. Each
//! worker runs complete client/server conversations over in-memory pipes,
//! while every access the library makes to its own shared tables is
//! serialized through a registry of numbered locks that the harness installs
//! before the first worker starts.
//!
//! # Architecture
//!
//! ```text
//! WorkerPool ──spawns──> worker ──per iteration──> Exchange
//!     │                                  ┌────────────┴────────────┐
//!     │                              Endpoint(client)        Endpoint(server)
//!     │                                  └──── PipePair (c→s, s→c) ┘
//!     │                                               │
//!     └── installs LockRegistry ──> Hooks <── library shared tables
//! ```
//!
//! One conversation is strictly single-threaded: the [`exchange`] loop polls
//! both endpoints cooperatively and treats "would block" as a scheduling
//! signal. Parallelism only exists between workers.
//!
//! # Components
//!
//! - [`pipe`]: bounded non-blocking byte queues and the duplex pipe pair
//! - [`locking`]: lock registry, locking callback, per-lock usage counters
//! - [`hooks`]: library-side callback slot, serialized tables, error queue
//! - [`session`]: the seam to the underlying secure-session library
//! - [`endpoint`]: one side of a conversation with retry hints
//! - [`exchange`]: the duplex handshake/exchange state machine
//! - [`pool`]: worker fan-out, join, and aggregate reporting
//! - [`stats`]: per-context connection and cache statistics
//! - [`error`]: error types

#![forbid(unsafe_code)]

pub mod endpoint;
pub mod error;
pub mod exchange;
pub mod hooks;
pub mod locking;
pub mod pipe;
pub mod pool;
pub mod session;
pub mod stats;

pub use endpoint::{Endpoint, PendingHint, SessionSlot, StepOutcome};
pub use error::{AttemptError, EndpointError, ExchangeError, LockError, PoolError, SessionError};
pub use exchange::{CLIENT_HELLO, Exchange, ExchangeReport, Phase, SERVER_HELLO};
pub use hooks::{ErrorQueue, HookGuard, Hooks, Shared};
pub use locking::{LockMode, LockRegistry, LockStats, LockUsage, Locking, current_thread_id};
pub use pipe::{Link, Pipe, PipePair};
pub use pool::{MAX_THREADS, RunConfig, RunReport, WorkerOutcome, WorkerPool, WorkerReport};
pub use session::{HandleId, Role, Session, SessionContext, SessionLibrary, Step, Want};
pub use stats::ContextStats;
