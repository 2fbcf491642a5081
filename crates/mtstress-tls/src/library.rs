//! rustls as a multi-threaded session library.
//!
//! rustls keeps no process-global tables of its own, so the shared state
//! that workers contend on lives here: per-context statistics, the handle
//! counter, the per-thread error queue and the server session cache. Each of
//! them sits behind one [`TlsLock`] and is only reached through the hooks
//! the harness installs.
//!
//! Client handles carry their own resumption store. A handle reused across
//! connections therefore offers the ticket it was issued last time, and the
//! server resumes it from [`SessionCache`].

use std::{
    io::{self, Read, Write},
    path::PathBuf,
    sync::Arc,
};

use mtstress_core::{
    ContextStats, ErrorQueue, HandleId, Hooks, Link, Role, Session, SessionContext, SessionError,
    SessionLibrary, Shared, Step, Want,
};
use rustls::{
    ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection,
    client::Resumption,
    crypto::{CryptoProvider, ring},
    pki_types::{CertificateDer, ServerName},
    server::WebPkiClientVerifier,
    version::TLS13,
};
use tracing::{debug, info, trace};

use crate::{
    cache::SessionCache,
    credentials::{Identity, load_anchors},
    error::TlsError,
};

/// Lock identifiers used by the TLS library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsLock {
    /// Per-thread error queue
    ErrorQueue = 0,
    /// Client context statistics
    ClientContext = 1,
    /// Server context statistics
    ServerContext = 2,
    /// Server session cache
    SessionCache = 3,
    /// Session handle counter
    Handles = 4,
}

impl TlsLock {
    /// Number of lock identifiers.
    pub const COUNT: usize = 5;

    const ALL: [Self; Self::COUNT] =
        [Self::ErrorQueue, Self::ClientContext, Self::ServerContext, Self::SessionCache, Self::Handles];

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
            Self::ErrorQueue => "err",
            Self::ClientContext => "ssl_ctx_client",
            Self::ServerContext => "ssl_ctx_server",
            Self::SessionCache => "ssl_session",
            Self::Handles => "ssl",
        }
    }
}

/// How the TLS library is configured.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// PEM file with the server chain and key; generated when absent
    pub server_cert: Option<PathBuf>,
    /// PEM file with the client chain and key; generated when absent
    pub client_cert: Option<PathBuf>,
    /// PEM bundle of trust anchors
    pub ca_file: Option<PathBuf>,
    /// Directory of PEM trust anchors
    pub ca_path: Option<PathBuf>,
    /// Verify the server against the CA file/dir instead of pinning it
    pub server_auth: bool,
    /// Require and verify a client certificate
    pub client_auth: bool,
    /// Name the client connects to and the generated server certificate is
    /// issued for
    pub server_name: String,
    /// Capacity of the server session cache
    pub session_cache_size: usize,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            server_cert: None,
            client_cert: None,
            ca_file: None,
            ca_path: None,
            server_auth: false,
            client_auth: false,
            server_name: "localhost".to_string(),
            session_cache_size: 256,
        }
    }
}

/// Name in the generated client certificate.
const CLIENT_NAME: &str = "mtstress-client";

/// Sessions minted per client handle's resumption store.
const CLIENT_TICKETS: usize = 4;

#[derive(Debug)]
struct TlsCore {
    hooks: Arc<Hooks>,
    errors: ErrorQueue,
    handles: Shared<u64>,
    client_stats: Shared<ContextStats>,
    server_stats: Shared<ContextStats>,
    cache: Arc<SessionCache>,
    server_name: ServerName<'static>,
}

impl TlsCore {
    fn stats(&self, role: Role, f: impl FnOnce(&mut ContextStats)) {
        let table = match role {
            Role::Client => &self.client_stats,
            Role::Server => &self.server_stats,
        };
        table.with(&self.hooks, f);
    }

    fn fail(&self, role: Role, handle: HandleId, err: impl std::fmt::Display) -> SessionError {
        let message = format!("{role} {handle}: {err}");
        self.errors.push(&self.hooks, message.clone());
        SessionError::Protocol(message)
    }
}

/// rustls client and server contexts sharing one set of hooks.
#[derive(Debug)]
pub struct TlsLibrary {
    core: Arc<TlsCore>,
    client: TlsContext,
    server: TlsContext,
}

impl TlsLibrary {
    /// Build both contexts from `settings`.
    ///
    /// # Errors
    ///
    /// - `Credential` if a certificate or key cannot be loaded or generated
    /// - `NoTrustAnchors` if peer verification is requested without anchors
    /// - `Config`/`Verifier` if rustls rejects the resulting configuration
    pub fn new(settings: &TlsSettings) -> Result<Self, TlsError> {
        let provider = Arc::new(ring::default_provider());
        let server_name = ServerName::try_from(settings.server_name.clone())?;

        let server_id =
            Identity::load_or_generate(settings.server_cert.as_deref(), &settings.server_name)?;
        let client_id = Identity::load_or_generate(settings.client_cert.as_deref(), CLIENT_NAME)?;
        let anchors = load_anchors(settings.ca_file.as_deref(), settings.ca_path.as_deref())?;

        let hooks = Arc::new(Hooks::new());
        let cache = Arc::new(SessionCache::new(
            Arc::clone(&hooks),
            TlsLock::SessionCache.id(),
            settings.session_cache_size,
        ));

        let (server, pinned) =
            server_config(settings, &provider, server_id, &client_id, &anchors, &cache)?;
        let client = client_config(settings, &provider, &pinned, client_id, &anchors)?;

        info!(
            server_name = %settings.server_name,
            server_auth = settings.server_auth,
            client_auth = settings.client_auth,
            anchors = anchors.len(),
            "tls contexts ready"
        );

        let core = Arc::new(TlsCore {
            hooks,
            errors: ErrorQueue::new(TlsLock::ErrorQueue.id()),
            handles: Shared::new(TlsLock::Handles.id(), 0),
            client_stats: Shared::new(TlsLock::ClientContext.id(), ContextStats::default()),
            server_stats: Shared::new(TlsLock::ServerContext.id(), ContextStats::default()),
            cache,
            server_name,
        });

        Ok(Self {
            client: TlsContext {
                core: Arc::clone(&core),
                config: ContextConfig::Client(Arc::new(client)),
            },
            server: TlsContext {
                core: Arc::clone(&core),
                config: ContextConfig::Server(Arc::new(server)),
            },
            core,
        })
    }
}

fn trust_store(anchors: &[CertificateDer<'static>]) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for anchor in anchors {
        roots.add(anchor.clone())?;
    }
    Ok(roots)
}

/// Server config plus the chain the client pins when not verifying.
fn server_config(
    settings: &TlsSettings,
    provider: &Arc<CryptoProvider>,
    identity: Identity,
    client_id: &Identity,
    anchors: &[CertificateDer<'static>],
    cache: &Arc<SessionCache>,
) -> Result<(ServerConfig, Vec<CertificateDer<'static>>), TlsError> {
    let builder = ServerConfig::builder_with_provider(Arc::clone(provider))
        .with_protocol_versions(&[&TLS13])?;

    let builder = if settings.client_auth {
        let roots =
            if anchors.is_empty() { trust_store(&client_id.chain)? } else { trust_store(anchors)? };
        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(provider))
                .build()?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    let pinned = identity.chain.clone();
    let mut config = builder.with_single_cert(identity.chain, identity.key)?;
    config.session_storage = Arc::clone(cache) as _;
    config.send_tls13_tickets = 1;
    Ok((config, pinned))
}

fn client_config(
    settings: &TlsSettings,
    provider: &Arc<CryptoProvider>,
    server_chain: &[CertificateDer<'static>],
    identity: Identity,
    anchors: &[CertificateDer<'static>],
) -> Result<ClientConfig, TlsError> {
    let roots = if settings.server_auth {
        if anchors.is_empty() {
            return Err(TlsError::NoTrustAnchors("server"));
        }
        trust_store(anchors)?
    } else {
        trust_store(server_chain)?
    };

    let builder = ClientConfig::builder_with_provider(Arc::clone(provider))
        .with_protocol_versions(&[&TLS13])?
        .with_root_certificates(roots);

    let mut config = if settings.client_auth {
        builder.with_client_auth_cert(identity.chain, identity.key)?
    } else {
        builder.with_no_client_auth()
    };
    config.resumption = Resumption::disabled();
    Ok(config)
}

impl SessionLibrary for TlsLibrary {
    type Context = TlsContext;

    fn lock_count(&self) -> usize {
        TlsLock::COUNT
    }

    fn lock_name(&self, id: usize) -> &'static str {
        TlsLock::from_id(id).map_or("unknown", TlsLock::name)
    }

    fn hooks(&self) -> &Hooks {
        &self.core.hooks
    }

    fn client(&self) -> &TlsContext {
        &self.client
    }

    fn server(&self) -> &TlsContext {
        &self.server
    }

    fn drain_errors(&self) -> Vec<String> {
        self.core.errors.drain(&self.core.hooks)
    }
}

#[derive(Debug, Clone)]
enum ContextConfig {
    Client(Arc<ClientConfig>),
    Server(Arc<ServerConfig>),
}

/// A rustls client or server context.
#[derive(Debug)]
pub struct TlsContext {
    core: Arc<TlsCore>,
    config: ContextConfig,
}

impl SessionContext for TlsContext {
    type Session = TlsSession;

    fn role(&self) -> Role {
        match self.config {
            ContextConfig::Client(_) => Role::Client,
            ContextConfig::Server(_) => Role::Server,
        }
    }

    fn new_session(&self) -> Result<TlsSession, SessionError> {
        let role = self.role();
        let handle = self.core.handles.with(&self.core.hooks, |next| {
            *next += 1;
            HandleId(*next)
        });
        self.core.stats(role, |stats| stats.sessions += 1);

        // Each client handle resumes only from its own tickets.
        let config = match &self.config {
            ContextConfig::Client(base) => {
                let mut config = ClientConfig::clone(base);
                config.resumption = Resumption::in_memory_sessions(CLIENT_TICKETS);
                ContextConfig::Client(Arc::new(config))
            },
            server @ ContextConfig::Server(_) => server.clone(),
        };

        trace!(%role, %handle, "session allocated");
        Ok(TlsSession {
            core: Arc::clone(&self.core),
            handle,
            role,
            config,
            conn: None,
            buffered: 0,
            finished: false,
        })
    }

    fn stats(&self) -> ContextStats {
        let role = self.role();
        let mut stats = ContextStats::default();
        self.core.stats(role, |current| stats = *current);
        if role == Role::Server {
            self.core.cache.fill_stats(&mut stats);
        }
        stats
    }
}

/// One rustls session handle.
#[derive(Debug)]
pub struct TlsSession {
    core: Arc<TlsCore>,
    handle: HandleId,
    role: Role,
    config: ContextConfig,
    conn: Option<Connection>,
    buffered: usize,
    finished: bool,
}

fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

/// Write queued TLS records until the pipe fills; returns bytes written.
fn write_out(conn: &mut Connection, link: &mut Link<'_>) -> io::Result<usize> {
    let mut written = 0;
    while conn.wants_write() {
        match conn.write_tls(&mut *link.outbound) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(err) if would_block(&err) => break,
            Err(err) => return Err(err),
        }
    }
    Ok(written)
}

impl TlsSession {
    /// Exchange TLS records with the pipes until neither side can move.
    fn pump(&mut self, link: &mut Link<'_>) -> Result<(), SessionError> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(SessionError::NotStarted);
        };

        loop {
            match conn.read_tls(&mut *link.inbound) {
                Ok(0) => break,
                Ok(_) => match conn.process_new_packets() {
                    Ok(state) => self.buffered = state.plaintext_bytes_to_read(),
                    Err(err) => {
                        // Let the peer see the alert before failing.
                        let _ = conn.write_tls(&mut *link.outbound);
                        return Err(self.core.fail(self.role, self.handle, err));
                    },
                },
                Err(err) if would_block(&err) => break,
                Err(err) => return Err(self.core.fail(self.role, self.handle, err)),
            }
        }

        if let Err(err) = write_out(conn, link) {
            return Err(self.core.fail(self.role, self.handle, err));
        }

        if !self.finished && !conn.is_handshaking() {
            self.finished = true;
            let role = self.role;
            self.core.stats(role, |stats| stats.record_finished(role));
            debug!(%role, handle = %self.handle, "handshake finished");
        }
        Ok(())
    }

    /// What a handshaking connection is waiting for.
    fn blocked(conn: &Connection) -> Step {
        if conn.wants_write() { Step::Blocked(Want::Write) } else { Step::Blocked(Want::Read) }
    }
}

impl Session for TlsSession {
    fn handle(&self) -> HandleId {
        self.handle
    }

    fn role(&self) -> Role {
        self.role
    }

    fn begin(&mut self) -> Result<(), SessionError> {
        let conn: Connection = match &self.config {
            ContextConfig::Client(config) => {
                ClientConnection::new(Arc::clone(config), self.core.server_name.clone())
                    .map(Into::into)
            },
            ContextConfig::Server(config) => ServerConnection::new(Arc::clone(config)).map(Into::into),
        }
        .map_err(|err| SessionError::Setup(err.to_string()))?;

        self.conn = Some(conn);
        self.buffered = 0;
        self.finished = false;
        let role = self.role;
        self.core.stats(role, |stats| stats.record_start(role));
        trace!(%role, handle = %self.handle, "connection started");
        Ok(())
    }

    fn write(&mut self, link: &mut Link<'_>, payload: &[u8]) -> Result<Step, SessionError> {
        self.pump(link)?;
        let Some(conn) = self.conn.as_mut() else {
            return Err(SessionError::NotStarted);
        };
        if conn.is_handshaking() {
            return Ok(Self::blocked(conn));
        }

        let written = conn.writer().write(payload);
        let n = written.map_err(|err| self.core.fail(self.role, self.handle, err))?;
        self.pump(link)?;
        Ok(Step::Transferred(n))
    }

    fn read(&mut self, link: &mut Link<'_>, buf: &mut [u8]) -> Result<Step, SessionError> {
        self.pump(link)?;
        let Some(conn) = self.conn.as_mut() else {
            return Err(SessionError::NotStarted);
        };

        let received = conn.reader().read(buf);
        match received {
            Ok(0) => Ok(Step::Closed),
            Ok(n) => {
                self.buffered = self.buffered.saturating_sub(n);
                Ok(Step::Transferred(n))
            },
            Err(err) if would_block(&err) => Ok(Self::blocked(conn)),
            Err(err) => Err(self.core.fail(self.role, self.handle, err)),
        }
    }

    fn pending(&self) -> usize {
        self.buffered
    }

    fn wants_write(&self) -> bool {
        self.conn.as_ref().is_some_and(|conn| conn.wants_write())
    }

    fn flush(&mut self, link: &mut Link<'_>) -> Result<usize, SessionError> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(0);
        };
        write_out(conn, link).map_err(|err| self.core.fail(self.role, self.handle, err))
    }

    fn is_handshaking(&self) -> bool {
        self.conn.as_ref().is_some_and(|conn| conn.is_handshaking())
    }

    fn state(&self) -> &'static str {
        match &self.conn {
            None => "idle",
            Some(conn) if conn.is_handshaking() => "handshaking",
            Some(_) => "established",
        }
    }

    fn shutdown(&mut self) {
        self.conn = None;
        self.buffered = 0;
    }
}
