//! Duplex handshake and exchange state machine.
//!
//! One [`Exchange`] runs a single conversation to completion on the calling
//! thread. The client sends its greeting then reads the server's; the server
//! reads first then replies. Each round, a side is stepped only when it can
//! make progress: it wants to write, it wants to read and bytes are
//! waiting for it (in its inbound pipe or buffered inside the session), or
//! the session still holds records its outbound pipe has room for. A done
//! side keeps being stepped for that last reason only. A round in which neither side can move, before both are done, is a startup
//! deadlock.

use tracing::{debug, trace};

use crate::{
    endpoint::{Endpoint, PendingHint, StepOutcome},
    error::ExchangeError,
    pipe::{Link, PipePair},
    session::{HandleId, Role, Session},
};

/// Greeting the client sends once the handshake allows it.
pub const CLIENT_HELLO: &[u8] = b"hello from client\n";

/// Greeting the server sends in reply.
pub const SERVER_HELLO: &[u8] = b"hello from server\n";

const READ_CHUNK: usize = 100;

/// Progress of one side of the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// The side still has to send its message.
    NeedWrite,
    /// The side still has to receive its peer's message.
    NeedRead,
    /// Both halves of the side's script are complete.
    Done,
}

impl Phase {
    fn hint(self) -> PendingHint {
        match self {
            Self::NeedWrite => PendingHint::WantWrite,
            Self::NeedRead => PendingHint::WantRead,
            Self::Done => PendingHint::None,
        }
    }

    fn plan(self) -> [Self; 2] {
        match self {
            Self::NeedWrite => [Self::NeedWrite, Self::NeedRead],
            Self::NeedRead => [Self::NeedRead, Self::NeedWrite],
            Self::Done => [Self::Done, Self::Done],
        }
    }
}

/// Outcome of a completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeReport {
    /// Rounds in which at least one side was stepped
    pub rounds: usize,
    /// Bytes the client received
    pub client_received: Vec<u8>,
    /// Bytes the server received
    pub server_received: Vec<u8>,
    /// Client session handle
    pub client_handle: HandleId,
    /// Server session handle
    pub server_handle: HandleId,
    /// Raw bytes that crossed the client-to-server pipe
    pub client_bytes: u64,
    /// Raw bytes that crossed the server-to-client pipe
    pub server_bytes: u64,
}

struct Side<'a, S: Session> {
    endpoint: Endpoint<'a, S>,
    phase: Phase,
    plan: [Phase; 2],
    message: Vec<u8>,
    expected: Vec<u8>,
    sent: usize,
    received: Vec<u8>,
}

impl<'a, S: Session> Side<'a, S> {
    fn new(mut endpoint: Endpoint<'a, S>, start: Phase, message: &[u8], expected: &[u8]) -> Self {
        endpoint.set_hint(start.hint());
        Self {
            endpoint,
            phase: start,
            plan: start.plan(),
            message: message.to_vec(),
            expected: expected.to_vec(),
            sent: 0,
            received: Vec::new(),
        }
    }

    fn restart(&mut self, start: Phase) {
        self.phase = start;
        self.plan = start.plan();
        self.endpoint.set_hint(start.hint());
    }

    fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Whether stepping this side can make progress, given the bytes in its
    /// inbound pipe and the room left in its outbound pipe.
    fn ready(&self, inbound: usize, room: usize) -> bool {
        // Held records must reach the pipe whatever the phase.
        if room > 0 && self.endpoint.wants_write() {
            return true;
        }
        match self.endpoint.hint() {
            PendingHint::WantWrite => true,
            PendingHint::WantRead => inbound > 0 || self.endpoint.pending() > 0,
            PendingHint::None => false,
        }
    }

    fn poll(&mut self, link: &mut Link<'_>) -> Result<(), ExchangeError> {
        match self.phase {
            Phase::NeedWrite => {
                let outcome = self.endpoint.step_write(link, &self.message[self.sent..])?;
                if let StepOutcome::Wrote(n) = outcome {
                    self.sent += n;
                    if self.sent >= self.message.len() {
                        self.advance();
                    } else {
                        self.endpoint.set_hint(PendingHint::WantWrite);
                    }
                }
            },
            Phase::NeedRead => {
                let mut chunk = [0u8; READ_CHUNK];
                let outcome = self.endpoint.step_read(link, &mut chunk)?;
                if let StepOutcome::Read(n) = outcome {
                    self.received.extend_from_slice(&chunk[..n]);
                    if self.received.len() >= self.expected.len() {
                        if self.received != self.expected {
                            return Err(ExchangeError::PayloadMismatch {
                                role: self.endpoint.role(),
                                expected: self.expected.clone(),
                                received: self.received.clone(),
                            });
                        }
                        self.advance();
                    } else {
                        self.endpoint.set_hint(PendingHint::WantRead);
                    }
                }
            },
            Phase::Done => {
                self.endpoint.flush(link)?;
            },
        }
        Ok(())
    }

    fn advance(&mut self) {
        self.phase = if self.phase == self.plan[0] { self.plan[1] } else { Phase::Done };
        trace!(role = %self.endpoint.role(), phase = ?self.phase, "side advanced");
        self.endpoint.set_hint(self.phase.hint());
    }
}

/// A single client/server conversation over a fresh pipe pair.
pub struct Exchange<'a, S: Session> {
    client: Side<'a, S>,
    server: Side<'a, S>,
    pipes: PipePair,
}

impl<'a, S: Session> Exchange<'a, S> {
    /// Pair a client and a server endpoint over pipes of `pipe_capacity`.
    ///
    /// # Errors
    ///
    /// `RoleMismatch` if either endpoint sits on the wrong side.
    pub fn new(
        client: Endpoint<'a, S>,
        server: Endpoint<'a, S>,
        pipe_capacity: usize,
    ) -> Result<Self, ExchangeError> {
        for (endpoint, expected) in [(&client, Role::Client), (&server, Role::Server)] {
            let found = endpoint.role();
            if found != expected {
                return Err(ExchangeError::RoleMismatch { expected, found });
            }
        }

        Ok(Self {
            client: Side::new(client, Phase::NeedWrite, CLIENT_HELLO, SERVER_HELLO),
            server: Side::new(server, Phase::NeedRead, SERVER_HELLO, CLIENT_HELLO),
            pipes: PipePair::new(pipe_capacity),
        })
    }

    /// Override the phase each side starts in.
    pub fn with_start(mut self, client: Phase, server: Phase) -> Self {
        self.client.restart(client);
        self.server.restart(server);
        self
    }

    /// Override the greetings each side sends.
    ///
    /// # Errors
    ///
    /// `EmptyMessage` if either greeting is empty.
    pub fn with_messages(mut self, client: &[u8], server: &[u8]) -> Result<Self, ExchangeError> {
        for (message, role) in [(client, Role::Client), (server, Role::Server)] {
            if message.is_empty() {
                return Err(ExchangeError::EmptyMessage { role });
            }
        }

        self.client.message = client.to_vec();
        self.client.expected = server.to_vec();
        self.server.message = server.to_vec();
        self.server.expected = client.to_vec();
        Ok(self)
    }

    /// Current phase of the client and the server.
    pub fn phases(&self) -> (Phase, Phase) {
        (self.client.phase, self.server.phase)
    }

    /// Drive both sides until they are done.
    ///
    /// # Errors
    ///
    /// - `Endpoint` if either side fails fatally or closes during startup
    /// - `StartupDeadlock` if neither side can make progress
    /// - `PayloadMismatch` if a side receives the wrong greeting
    pub fn run(mut self) -> Result<ExchangeReport, ExchangeError> {
        let mut rounds = 0;

        while !(self.client.is_done() && self.server.is_done()) {
            let client_ready = self
                .client
                .ready(self.pipes.server_to_client.pending(), self.pipes.client_to_server.room());
            let server_ready = self
                .server
                .ready(self.pipes.client_to_server.pending(), self.pipes.server_to_client.room());

            if !client_ready && !server_ready {
                debug!(
                    rounds,
                    client = self.client.endpoint.state(),
                    server = self.server.endpoint.state(),
                    "startup deadlock"
                );
                return Err(ExchangeError::StartupDeadlock {
                    rounds,
                    client: self.client.phase,
                    server: self.server.phase,
                });
            }

            rounds += 1;
            trace!(rounds, client_ready, server_ready, "exchange round");

            if client_ready {
                self.client.poll(&mut self.pipes.client_link())?;
            }
            if server_ready {
                self.server.poll(&mut self.pipes.server_link())?;
            }
        }

        self.client.endpoint.shutdown();
        self.server.endpoint.shutdown();

        let report = ExchangeReport {
            rounds,
            client_handle: self.client.endpoint.handle(),
            server_handle: self.server.endpoint.handle(),
            client_received: self.client.received,
            server_received: self.server.received,
            client_bytes: self.pipes.client_to_server.bytes_written(),
            server_bytes: self.pipes.server_to_client.bytes_written(),
        };
        debug!(
            rounds,
            client = %report.client_handle,
            server = %report.server_handle,
            "exchange complete"
        );
        Ok(report)
    }
}
