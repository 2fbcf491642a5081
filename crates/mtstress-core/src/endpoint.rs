//! Endpoint driver: one side of a conversation.
//!
//! An [`Endpoint`] wraps a library session and turns each library step into
//! a [`StepOutcome`] plus a [`PendingHint`] recording what the session needs
//! before it can continue. Would-block is never an error here; only library
//! failures and an orderly close during startup are.
//!
//! The session is either owned by the endpoint (one handle per attempt) or
//! borrowed from the worker (one handle reused across attempts). Ownership
//! is chosen by the caller, never decided at runtime.

use tracing::trace;

use crate::{
    error::EndpointError,
    pipe::Link,
    session::{HandleId, Role, Session, Step, Want},
};

/// Who owns the session handle behind an endpoint.
#[derive(Debug)]
pub enum SessionSlot<'a, S> {
    /// The endpoint owns the handle and releases it when dropped.
    Owned(S),
    /// The worker owns the handle and keeps it across attempts.
    Borrowed(&'a mut S),
}

impl<S> SessionSlot<'_, S> {
    fn get(&self) -> &S {
        match self {
            Self::Owned(session) => session,
            Self::Borrowed(session) => session,
        }
    }

    fn get_mut(&mut self) -> &mut S {
        match self {
            Self::Owned(session) => session,
            Self::Borrowed(session) => session,
        }
    }

    /// Whether the endpoint owns the handle.
    pub fn is_owned(&self) -> bool {
        matches!(self, Self::Owned(_))
    }
}

/// What the endpoint needs before its next step can make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PendingHint {
    /// Nothing; the endpoint is idle or finished.
    #[default]
    None,
    /// Bytes from the peer.
    WantRead,
    /// Permission to write.
    WantWrite,
}

impl From<Want> for PendingHint {
    fn from(want: Want) -> Self {
        match want {
            Want::Read => Self::WantRead,
            Want::Write => Self::WantWrite,
        }
    }
}

/// Non-fatal result of one endpoint step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Application bytes accepted by the session.
    Wrote(usize),
    /// Application bytes delivered by the session.
    Read(usize),
    /// The step could not proceed; retry after the peer moves.
    WouldBlock(Want),
}

/// One protocol endpoint bound to a role.
#[derive(Debug)]
pub struct Endpoint<'a, S: Session> {
    session: SessionSlot<'a, S>,
    hint: PendingHint,
}

impl<'a, S: Session> Endpoint<'a, S> {
    /// Start a new connection on an owned session.
    pub fn owned(session: S) -> Result<Self, EndpointError> {
        Self::start(SessionSlot::Owned(session))
    }

    /// Start a new connection on a session the caller keeps.
    pub fn borrowed(session: &'a mut S) -> Result<Self, EndpointError> {
        Self::start(SessionSlot::Borrowed(session))
    }

    fn start(mut session: SessionSlot<'a, S>) -> Result<Self, EndpointError> {
        let target = session.get_mut();
        let role = target.role();
        target.begin().map_err(|source| EndpointError::Fatal { role, source })?;
        Ok(Self { session, hint: PendingHint::None })
    }

    /// Role of the wrapped session.
    pub fn role(&self) -> Role {
        self.session.get().role()
    }

    /// Identity of the wrapped session handle.
    pub fn handle(&self) -> HandleId {
        self.session.get().handle()
    }

    /// Retry hint left by the last step.
    pub fn hint(&self) -> PendingHint {
        self.hint
    }

    /// Override the retry hint.
    pub fn set_hint(&mut self, hint: PendingHint) {
        self.hint = hint;
    }

    /// Whether the endpoint owns its session handle.
    pub fn owns_session(&self) -> bool {
        self.session.is_owned()
    }

    /// Plaintext already buffered in the session.
    pub fn pending(&self) -> usize {
        self.session.get().pending()
    }

    /// Whether the handshake is still in progress.
    pub fn is_handshaking(&self) -> bool {
        self.session.get().is_handshaking()
    }

    /// Library description of the handshake state.
    pub fn state(&self) -> &'static str {
        self.session.get().state()
    }

    /// Whether the session still holds bytes for the outbound pipe.
    pub fn wants_write(&self) -> bool {
        self.session.get().wants_write()
    }

    /// Push held bytes into the outbound pipe. The hint is left alone.
    pub fn flush(&mut self, link: &mut Link<'_>) -> Result<usize, EndpointError> {
        let session = self.session.get_mut();
        let role = session.role();
        session.flush(link).map_err(|source| {
            self.hint = PendingHint::None;
            EndpointError::Fatal { role, source }
        })
    }

    /// Try to advance the handshake and send `payload`.
    pub fn step_write(
        &mut self,
        link: &mut Link<'_>,
        payload: &[u8],
    ) -> Result<StepOutcome, EndpointError> {
        let step = self.session.get_mut().write(link, payload);
        self.settle(step).map(|n| n.map_or_else(StepOutcome::WouldBlock, StepOutcome::Wrote))
    }

    /// Try to advance the handshake and receive into `buf`.
    pub fn step_read(
        &mut self,
        link: &mut Link<'_>,
        buf: &mut [u8],
    ) -> Result<StepOutcome, EndpointError> {
        let step = self.session.get_mut().read(link, buf);
        self.settle(step).map(|n| n.map_or_else(StepOutcome::WouldBlock, StepOutcome::Read))
    }

    /// Mark the connection finished.
    pub fn shutdown(&mut self) {
        self.session.get_mut().shutdown();
        self.hint = PendingHint::None;
    }

    /// Fold a library step into the hint; `Err(want)` means would-block.
    fn settle(
        &mut self,
        step: Result<Step, crate::error::SessionError>,
    ) -> Result<Result<usize, Want>, EndpointError> {
        let role = self.role();
        match step {
            Ok(Step::Transferred(0) | Step::Closed) => {
                self.hint = PendingHint::None;
                Err(EndpointError::StartupFailed { role })
            },
            Ok(Step::Transferred(n)) => {
                self.hint = PendingHint::None;
                Ok(Ok(n))
            },
            Ok(Step::Blocked(want)) => {
                trace!(%role, ?want, state = self.state(), "endpoint would block");
                self.hint = want.into();
                Ok(Err(want))
            },
            Err(source) => {
                self.hint = PendingHint::None;
                Err(EndpointError::Fatal { role, source })
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::SessionError, pipe::PipePair};

    /// Session that replays a fixed list of steps.
    struct Scripted {
        role: Role,
        steps: Vec<Result<Step, SessionError>>,
        begun: usize,
    }

    impl Scripted {
        fn new(role: Role, mut steps: Vec<Result<Step, SessionError>>) -> Self {
            steps.reverse();
            Self { role, steps, begun: 0 }
        }

        fn next(&mut self) -> Result<Step, SessionError> {
            self.steps.pop().unwrap_or(Ok(Step::Blocked(Want::Read)))
        }
    }

    impl Session for Scripted {
        fn handle(&self) -> HandleId {
            HandleId(7)
        }

        fn role(&self) -> Role {
            self.role
        }

        fn begin(&mut self) -> Result<(), SessionError> {
            self.begun += 1;
            Ok(())
        }

        fn write(&mut self, _: &mut Link<'_>, _: &[u8]) -> Result<Step, SessionError> {
            self.next()
        }

        fn read(&mut self, _: &mut Link<'_>, _: &mut [u8]) -> Result<Step, SessionError> {
            self.next()
        }

        fn pending(&self) -> usize {
            0
        }

        fn is_handshaking(&self) -> bool {
            false
        }

        fn state(&self) -> &'static str {
            "scripted"
        }

        fn shutdown(&mut self) {}
    }

    #[test]
    fn would_block_sets_hint() {
        let session = Scripted::new(Role::Client, vec![Ok(Step::Blocked(Want::Write))]);
        let mut endpoint = Endpoint::owned(session).unwrap();
        let mut pipes = PipePair::default();

        let outcome = endpoint.step_write(&mut pipes.client_link(), b"x").unwrap();
        assert_eq!(outcome, StepOutcome::WouldBlock(Want::Write));
        assert_eq!(endpoint.hint(), PendingHint::WantWrite);
    }

    #[test]
    fn transfer_clears_hint() {
        let session = Scripted::new(
            Role::Server,
            vec![Ok(Step::Blocked(Want::Read)), Ok(Step::Transferred(5))],
        );
        let mut endpoint = Endpoint::owned(session).unwrap();
        let mut pipes = PipePair::default();
        let mut buf = [0u8; 8];

        endpoint.step_read(&mut pipes.server_link(), &mut buf).unwrap();
        assert_eq!(endpoint.hint(), PendingHint::WantRead);

        let outcome = endpoint.step_read(&mut pipes.server_link(), &mut buf).unwrap();
        assert_eq!(outcome, StepOutcome::Read(5));
        assert_eq!(endpoint.hint(), PendingHint::None);
    }

    #[test]
    fn library_error_is_fatal() {
        let failure = SessionError::Protocol("bad record".into());
        let session = Scripted::new(Role::Server, vec![Err(failure.clone())]);
        let mut endpoint = Endpoint::owned(session).unwrap();
        let mut pipes = PipePair::default();

        let err = endpoint.step_write(&mut pipes.server_link(), b"x").unwrap_err();
        assert_eq!(err, EndpointError::Fatal { role: Role::Server, source: failure });
    }

    #[test]
    fn close_during_startup_is_fatal() {
        let session = Scripted::new(Role::Client, vec![Ok(Step::Closed)]);
        let mut endpoint = Endpoint::owned(session).unwrap();
        let mut pipes = PipePair::default();
        let mut buf = [0u8; 8];

        let err = endpoint.step_read(&mut pipes.client_link(), &mut buf).unwrap_err();
        assert_eq!(err, EndpointError::StartupFailed { role: Role::Client });
    }

    #[test]
    fn borrowed_session_survives_endpoint() {
        let mut session = Scripted::new(Role::Client, vec![]);
        {
            let endpoint = Endpoint::borrowed(&mut session).unwrap();
            assert!(!endpoint.owns_session());
            assert_eq!(endpoint.handle(), HandleId(7));
        }
        {
            let _again = Endpoint::borrowed(&mut session).unwrap();
        }
        assert_eq!(session.begun, 2);
    }
}
