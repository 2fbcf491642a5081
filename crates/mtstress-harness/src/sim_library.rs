//! Simulated secure-session library.
//!
//! # Handshake
//!
//! ```text
//! client                         server
//!   │ ── ClientHello(id?) ──────>  │  cache lookup: hit resumes, miss mints id
//!   │ <───── ServerHello(id, r) ── │
//!   │ ── Finished ──────────────>  │
//!   │ <════ AppData / Close ═════> │
//! ```
//!
//! A client handle remembers the session id it was granted, so starting a
//! new connection on the same handle offers it again and the server resumes
//! from its cache.
//!
//! # Shared state
//!
//! Everything more than one worker can touch lives in a [`Shared`] table
//! bound to one [`SimLock`]: the error queue, context statistics and handle
//! counter, the session cache, the id generator and the journal. With the
//! harness callback installed, every access bumps the matching lock counter.

use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

use mtstress_core::{
    ContextStats, ErrorQueue, HandleId, Hooks, Link, Role, Session, SessionContext, SessionError,
    SessionLibrary, Shared, Step, Want,
};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, trace};

use crate::record::{Record, RecordError, RecordKind};

/// Lock identifiers used by the simulated library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimLock {
    /// Per-thread error queue
    Error = 0,
    /// Context statistics and handle allocation
    Context = 1,
    /// Server session cache
    SessionCache = 2,
    /// Session id generator
    Rand = 3,
    /// Handle journal
    Journal = 4,
}

impl SimLock {
    /// Number of lock identifiers.
    pub const COUNT: usize = 5;

    const ALL: [Self; Self::COUNT] =
        [Self::Error, Self::Context, Self::SessionCache, Self::Rand, Self::Journal];

    /// Lock for identifier `id`.
    pub fn from_id(id: usize) -> Option<Self> {
        Self::ALL.get(id).copied()
    }

    /// Identifier passed to the locking callback.
    pub fn id(self) -> usize {
        self as usize
    }

    /// Name reported next to the lock's counter.
    pub fn name(self) -> &'static str {
        match self {
            Self::Error => "err",
            Self::Context => "ssl_ctx",
            Self::SessionCache => "ssl_session",
            Self::Rand => "rand",
            Self::Journal => "journal",
        }
    }
}

/// Faults injected by the server side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Faults {
    /// Answer every `ClientHello` with an alert.
    pub reject_handshake: bool,
    /// Flip a bit in every application record the server sends.
    pub corrupt_server_data: bool,
    /// Send an orderly close where the server's reply belongs.
    pub close_instead_of_reply: bool,
}

/// What happened to a session handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalEvent {
    /// The handle was allocated.
    Allocated,
    /// A connection was started on the handle.
    Started,
    /// The handshake finished.
    Established {
        /// Whether the session was resumed from the cache
        resumed: bool,
    },
}

/// One journal line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalEntry {
    /// Thread identifier from the locking callback
    pub thread: u64,
    /// Session handle
    pub handle: HandleId,
    /// Role of the handle
    pub role: Role,
    /// Event
    pub event: JournalEvent,
}

/// Snapshot of the journal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Journal {
    entries: Vec<JournalEntry>,
}

impl Journal {
    /// Every entry in order.
    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    /// Handles on which `role` connections were started by `thread`, one
    /// element per connection.
    pub fn started_by(&self, thread: u64, role: Role) -> Vec<HandleId> {
        self.entries
            .iter()
            .filter(|e| e.thread == thread && e.role == role && e.event == JournalEvent::Started)
            .map(|e| e.handle)
            .collect()
    }

    /// Number of handshakes that finished by resumption in `role`.
    pub fn resumed(&self, role: Role) -> usize {
        self.entries
            .iter()
            .filter(|e| e.role == role && e.event == JournalEvent::Established { resumed: true })
            .count()
    }
}

/// Sessions the server remembers when none is configured.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Server session ids, oldest evicted first.
#[derive(Debug)]
struct SessionCache {
    ids: HashSet<u64>,
    order: VecDeque<u64>,
    capacity: usize,
    hits: u64,
    misses: u64,
}

impl SessionCache {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            hits: 0,
            misses: 0,
        }
    }

    fn insert(&mut self, id: u64) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        self.evict();
    }

    fn evict(&mut self) {
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

#[derive(Debug)]
struct Counters {
    next_handle: u64,
    client: ContextStats,
    server: ContextStats,
}

impl Counters {
    fn for_role(&mut self, role: Role) -> &mut ContextStats {
        match role {
            Role::Client => &mut self.client,
            Role::Server => &mut self.server,
        }
    }
}

/// State shared by the library, its contexts and every session.
#[derive(Debug)]
struct SimCore {
    hooks: Hooks,
    errors: ErrorQueue,
    counters: Shared<Counters>,
    cache: Shared<SessionCache>,
    rng: Shared<ChaCha8Rng>,
    journal: Shared<Vec<JournalEntry>>,
    faults: Faults,
}

impl SimCore {
    fn record(&self, handle: HandleId, role: Role, event: JournalEvent) {
        let thread = self.hooks.thread_id();
        self.journal.with(&self.hooks, |journal| {
            journal.push(JournalEntry { thread, handle, role, event });
        });
    }

    fn stats(&self, role: Role, f: impl FnOnce(&mut ContextStats)) {
        self.counters.with(&self.hooks, |counters| f(counters.for_role(role)));
    }

    fn fail(&self, message: impl Into<String>) -> SessionError {
        let message = message.into();
        self.errors.push(&self.hooks, message.clone());
        SessionError::Protocol(message)
    }

    /// Look `offered` up in the cache, or mint a fresh id.
    fn grant(&self, offered: u64) -> (u64, bool) {
        let hit = offered != 0
            && self.cache.with(&self.hooks, |cache| {
                let hit = cache.ids.contains(&offered);
                if hit {
                    cache.hits += 1;
                } else {
                    cache.misses += 1;
                }
                hit
            });
        if hit {
            return (offered, true);
        }

        let id = self.rng.with(&self.hooks, |rng| rng.next_u64().max(1));
        self.cache.with(&self.hooks, |cache| cache.insert(id));
        (id, false)
    }
}

/// The simulated library: two contexts sharing one set of tables.
#[derive(Debug)]
pub struct SimLibrary {
    core: Arc<SimCore>,
    client: SimContext,
    server: SimContext,
}

impl SimLibrary {
    /// Fault-free library with the default id seed.
    pub fn new() -> Self {
        Self::with_faults(Faults::default())
    }

    /// Library injecting `faults`.
    pub fn with_faults(faults: Faults) -> Self {
        Self::with_options(faults, 0x6d74_7374)
    }

    /// Library injecting `faults`, minting session ids from `seed`.
    pub fn with_options(faults: Faults, seed: u64) -> Self {
        let core = Arc::new(SimCore {
            hooks: Hooks::new(),
            errors: ErrorQueue::new(SimLock::Error.id()),
            counters: Shared::new(
                SimLock::Context.id(),
                Counters {
                    next_handle: 1,
                    client: ContextStats::default(),
                    server: ContextStats::default(),
                },
            ),
            cache: Shared::new(
                SimLock::SessionCache.id(),
                SessionCache::new(DEFAULT_CACHE_CAPACITY),
            ),
            rng: Shared::new(SimLock::Rand.id(), ChaCha8Rng::seed_from_u64(seed)),
            journal: Shared::new(SimLock::Journal.id(), Vec::new()),
            faults,
        });

        Self {
            client: SimContext { role: Role::Client, core: Arc::clone(&core) },
            server: SimContext { role: Role::Server, core: Arc::clone(&core) },
            core,
        }
    }

    /// Keep at most `capacity` sessions in the server cache.
    #[must_use]
    pub fn with_cache_capacity(self, capacity: usize) -> Self {
        self.core.cache.with(&self.core.hooks, |cache| {
            cache.capacity = capacity.max(1);
            cache.evict();
        });
        self
    }

    /// Snapshot of the handle journal.
    pub fn journal(&self) -> Journal {
        let entries = self.core.journal.with(&self.core.hooks, |journal| journal.clone());
        Journal { entries }
    }

    /// Faults this library injects.
    pub fn faults(&self) -> Faults {
        self.core.faults
    }
}

impl Default for SimLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLibrary for SimLibrary {
    type Context = SimContext;

    fn lock_count(&self) -> usize {
        SimLock::COUNT
    }

    fn lock_name(&self, id: usize) -> &'static str {
        SimLock::from_id(id).map_or("unknown", SimLock::name)
    }

    fn hooks(&self) -> &Hooks {
        &self.core.hooks
    }

    fn client(&self) -> &SimContext {
        &self.client
    }

    fn server(&self) -> &SimContext {
        &self.server
    }

    fn drain_errors(&self) -> Vec<String> {
        self.core.errors.drain(&self.core.hooks)
    }
}

/// Session factory for one role.
#[derive(Debug)]
pub struct SimContext {
    role: Role,
    core: Arc<SimCore>,
}

impl SessionContext for SimContext {
    type Session = SimSession;

    fn role(&self) -> Role {
        self.role
    }

    fn new_session(&self) -> Result<SimSession, SessionError> {
        let role = self.role;
        let handle = self.core.counters.with(&self.core.hooks, |counters| {
            let handle = HandleId(counters.next_handle);
            counters.next_handle += 1;
            counters.for_role(role).sessions += 1;
            handle
        });
        self.core.record(handle, role, JournalEvent::Allocated);
        trace!(%role, %handle, "session allocated");

        Ok(SimSession {
            core: Arc::clone(&self.core),
            handle,
            role,
            state: State::Idle,
            session_id: 0,
            resumed: false,
            inbox: Vec::new(),
            outbox: VecDeque::new(),
            plaintext: VecDeque::new(),
            peer_closed: false,
        })
    }

    fn stats(&self) -> ContextStats {
        let mut stats =
            self.core.counters.with(&self.core.hooks, |counters| *counters.for_role(self.role));
        if self.role == Role::Server {
            self.core.cache.with(&self.core.hooks, |cache| {
                stats.cache_hits = cache.hits;
                stats.cache_misses = cache.misses;
                stats.cache_items = cache.ids.len() as u64;
            });
        }
        stats
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    SendHello,
    AwaitServerHello,
    AwaitClientHello,
    AwaitFinished,
    Established,
    Failed,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            Self::Idle => "before connect",
            Self::SendHello => "send client hello",
            Self::AwaitServerHello => "read server hello",
            Self::AwaitClientHello => "read client hello",
            Self::AwaitFinished => "read finished",
            Self::Established => "established",
            Self::Failed => "failed",
        }
    }
}

/// One simulated session handle.
#[derive(Debug)]
pub struct SimSession {
    core: Arc<SimCore>,
    handle: HandleId,
    role: Role,
    state: State,
    session_id: u64,
    resumed: bool,
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
    plaintext: VecDeque<u8>,
    peer_closed: bool,
}

impl SimSession {
    /// Session id granted by the last finished handshake (0 = none).
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    fn queue(&mut self, record: &Record) {
        let mut wire = Vec::with_capacity(record.encoded_len());
        record.encode_into(&mut wire);
        self.outbox.extend(wire);
    }

    /// Move queued bytes into the pipe; true once the outbox is empty.
    fn drain_outbox(&mut self, link: &mut Link<'_>) -> bool {
        while !self.outbox.is_empty() {
            let (head, _) = self.outbox.as_slices();
            match link.outbound.push(head) {
                Some(n) => drop(self.outbox.drain(..n)),
                None => return false,
            }
        }
        true
    }

    fn fill(&mut self, link: &mut Link<'_>) {
        let mut chunk = [0u8; 512];
        while let Some(n) = link.inbound.pull(&mut chunk) {
            self.inbox.extend_from_slice(&chunk[..n]);
        }
    }

    fn next_record(&mut self) -> Result<Option<Record>, SessionError> {
        match Record::decode(&self.inbox) {
            Ok(Some((record, used))) => {
                self.inbox.drain(..used);
                Ok(Some(record))
            },
            Ok(None) => Ok(None),
            Err(err) => Err(self.abort(err)),
        }
    }

    fn abort(&mut self, err: RecordError) -> SessionError {
        self.state = State::Failed;
        self.core.fail(format!("{} {}: {err}", self.role, self.handle))
    }

    /// Run the handshake as far as the pipes allow.
    ///
    /// `Ok(None)` once established with nothing left to send.
    fn drive(&mut self, link: &mut Link<'_>) -> Result<Option<Want>, SessionError> {
        if link.outbound.capacity() <= Record::HEADER_LEN {
            return Err(SessionError::Setup(format!(
                "pipe capacity {} cannot carry a record",
                link.outbound.capacity()
            )));
        }

        self.fill(link);
        loop {
            if !self.drain_outbox(link) {
                return Ok(Some(Want::Write));
            }

            match self.state {
                State::Idle => return Err(SessionError::NotStarted),
                State::Failed => return Err(SessionError::Protocol("session failed".into())),
                State::Established => return Ok(None),
                State::SendHello => {
                    self.queue(&Record::client_hello(self.session_id));
                    self.state = State::AwaitServerHello;
                },
                State::AwaitServerHello | State::AwaitClientHello | State::AwaitFinished => {
                    let Some(record) = self.next_record()? else {
                        return Ok(Some(Want::Read));
                    };
                    self.handshake(&record)?;
                },
            }
        }
    }

    fn handshake(&mut self, record: &Record) -> Result<(), SessionError> {
        let state = self.state;
        match (state, record.kind) {
            (State::AwaitClientHello, RecordKind::ClientHello) => {
                if self.core.faults.reject_handshake {
                    self.state = State::Failed;
                    return Err(self.core.fail(format!("server {}: handshake rejected", self.handle)));
                }
                let offered = record.offered_session().map_err(|err| self.abort(err))?;
                let (id, resumed) = self.core.grant(offered);
                self.queue(&Record::server_hello(id, resumed));
                self.session_id = id;
                self.resumed = resumed;
                self.state = State::AwaitFinished;
            },
            (State::AwaitServerHello, RecordKind::ServerHello) => {
                let (id, resumed) = record.granted_session().map_err(|err| self.abort(err))?;
                self.session_id = id;
                self.resumed = resumed;
                self.queue(&Record::new(RecordKind::Finished, &[]));
                self.establish();
            },
            (State::AwaitFinished, RecordKind::Finished) => self.establish(),
            (_, RecordKind::Alert) => {
                self.state = State::Failed;
                return Err(self.core.fail(format!(
                    "{} {}: peer alert in state '{}'",
                    self.role,
                    self.handle,
                    state.name()
                )));
            },
            (_, kind) => {
                self.state = State::Failed;
                return Err(self.core.fail(format!(
                    "{} {}: unexpected {kind:?} in state '{}'",
                    self.role,
                    self.handle,
                    state.name()
                )));
            },
        }
        Ok(())
    }

    fn establish(&mut self) {
        let resumed = self.resumed;
        self.state = State::Established;
        self.core.stats(self.role, |stats| stats.record_finished(self.role));
        self.core.record(self.handle, self.role, JournalEvent::Established { resumed });
        debug!(role = %self.role, handle = %self.handle, resumed, "handshake finished");
    }

    fn drain_records(&mut self) -> Result<(), SessionError> {
        while let Some(record) = self.next_record()? {
            match record.kind {
                RecordKind::AppData => self.plaintext.extend(record.body),
                RecordKind::Close => self.peer_closed = true,
                kind => {
                    self.state = State::Failed;
                    return Err(self.core.fail(format!(
                        "{} {}: unexpected {kind:?} after handshake",
                        self.role, self.handle
                    )));
                },
            }
        }
        Ok(())
    }
}

impl Session for SimSession {
    fn handle(&self) -> HandleId {
        self.handle
    }

    fn role(&self) -> Role {
        self.role
    }

    fn begin(&mut self) -> Result<(), SessionError> {
        self.inbox.clear();
        self.outbox.clear();
        self.plaintext.clear();
        self.peer_closed = false;
        self.resumed = false;
        self.state = match self.role {
            Role::Client => State::SendHello,
            Role::Server => State::AwaitClientHello,
        };

        self.core.stats(self.role, |stats| stats.record_start(self.role));
        self.core.record(self.handle, self.role, JournalEvent::Started);
        trace!(role = %self.role, handle = %self.handle, offered = self.session_id, "connection started");
        Ok(())
    }

    fn write(&mut self, link: &mut Link<'_>, payload: &[u8]) -> Result<Step, SessionError> {
        if let Some(want) = self.drive(link)? {
            return Ok(Step::Blocked(want));
        }

        let room = link.outbound.room();
        if room <= Record::HEADER_LEN {
            return Ok(Step::Blocked(Want::Write));
        }
        let len = payload.len().min(room - Record::HEADER_LEN).min(Record::MAX_BODY);

        let record = if self.role == Role::Server && self.core.faults.close_instead_of_reply {
            Record::new(RecordKind::Close, &[])
        } else {
            let mut record = Record::new(RecordKind::AppData, &payload[..len]);
            if self.role == Role::Server && self.core.faults.corrupt_server_data {
                if let Some(byte) = record.body.first_mut() {
                    *byte ^= 0x20;
                }
            }
            record
        };

        self.queue(&record);
        self.drain_outbox(link);
        Ok(Step::Transferred(len))
    }

    fn read(&mut self, link: &mut Link<'_>, buf: &mut [u8]) -> Result<Step, SessionError> {
        if let Some(want) = self.drive(link)? {
            return Ok(Step::Blocked(want));
        }
        self.drain_records()?;

        if !self.plaintext.is_empty() {
            let n = buf.len().min(self.plaintext.len());
            for (slot, byte) in buf.iter_mut().zip(self.plaintext.drain(..n)) {
                *slot = byte;
            }
            return Ok(Step::Transferred(n));
        }
        if self.peer_closed {
            return Ok(Step::Closed);
        }
        Ok(Step::Blocked(Want::Read))
    }

    fn pending(&self) -> usize {
        self.plaintext.len()
    }

    fn wants_write(&self) -> bool {
        !self.outbox.is_empty()
    }

    fn flush(&mut self, link: &mut Link<'_>) -> Result<usize, SessionError> {
        let before = self.outbox.len();
        self.drain_outbox(link);
        Ok(before - self.outbox.len())
    }

    fn is_handshaking(&self) -> bool {
        !matches!(self.state, State::Established | State::Failed | State::Idle)
    }

    fn state(&self) -> &'static str {
        self.state.name()
    }

    fn shutdown(&mut self) {
        self.state = State::Idle;
    }
}

#[cfg(test)]
mod tests {
    use mtstress_core::PipePair;

    use super::*;

    #[test]
    fn lock_names_cover_every_id() {
        let library = SimLibrary::new();
        let names: Vec<_> = (0..library.lock_count()).map(|id| library.lock_name(id)).collect();
        assert_eq!(names, ["err", "ssl_ctx", "ssl_session", "rand", "journal"]);
        assert_eq!(library.lock_name(SimLock::COUNT), "unknown");
    }

    #[test]
    fn step_before_begin_is_rejected() {
        let library = SimLibrary::new();
        let mut session = library.client().new_session().unwrap();
        let mut pipes = PipePair::default();

        let err = session.write(&mut pipes.client_link(), b"x").unwrap_err();
        assert_eq!(err, SessionError::NotStarted);
    }

    #[test]
    fn client_hello_goes_out_on_first_write() {
        let library = SimLibrary::new();
        let mut client = library.client().new_session().unwrap();
        client.begin().unwrap();
        let mut pipes = PipePair::default();

        let step = client.write(&mut pipes.client_link(), b"hi").unwrap();
        assert_eq!(step, Step::Blocked(Want::Read));
        assert!(client.is_handshaking());
        assert_eq!(pipes.client_to_server.pending(), Record::client_hello(0).encoded_len());
    }

    #[test]
    fn handles_are_distinct_and_journaled() {
        let library = SimLibrary::new();
        let a = library.client().new_session().unwrap();
        let b = library.server().new_session().unwrap();
        assert_ne!(a.handle(), b.handle());

        let journal = library.journal();
        assert_eq!(journal.entries().len(), 2);
        assert!(journal.entries().iter().all(|e| e.event == JournalEvent::Allocated));
        assert_eq!(library.client().stats().sessions, 1);
        assert_eq!(library.server().stats().sessions, 1);
    }

    #[test]
    fn session_cache_evicts_oldest_id() {
        let library = SimLibrary::new().with_cache_capacity(2);
        let ids: Vec<u64> = (0..3).map(|_| library.core.grant(0).0).collect();
        assert_eq!(library.server().stats().cache_items, 2);

        let (reissued, resumed) = library.core.grant(ids[0]);
        assert!(!resumed);
        assert_ne!(reissued, ids[0]);
        assert_eq!(library.core.grant(ids[2]), (ids[2], true));

        for _ in 0..1000 {
            library.core.grant(0);
        }
        let stats = library.server().stats();
        assert_eq!((stats.cache_items, stats.cache_hits, stats.cache_misses), (2, 1, 1));
    }

    #[test]
    fn tiny_pipe_is_a_setup_error() {
        let library = SimLibrary::new();
        let mut client = library.client().new_session().unwrap();
        client.begin().unwrap();
        let mut pipes = PipePair::new(Record::HEADER_LEN);

        let err = client.write(&mut pipes.client_link(), b"x").unwrap_err();
        assert!(matches!(err, SessionError::Setup(_)));
    }
}
