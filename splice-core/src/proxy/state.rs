use std::{
    fmt,
    sync::{Arc, OnceLock},
};
use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFuture};
use tonic::{Status, metadata::MetadataMap};

/// Phase of a proxied call.
///
/// `Init → Routing → Streaming → Draining → Closed` is the happy path. A call ends in
/// `Rejected` when its path is malformed or the director refuses it, and in `Failed` when
/// its deadline expires while routing, or anything breaks once streaming started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Routing,
    Streaming,
    Draining,
    Closed,
    /// Refused before any backend was contacted.
    Rejected,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Closed | Phase::Rejected | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::Routing => "routing",
            Phase::Streaming => "streaming",
            Phase::Draining => "draining",
            Phase::Closed => "closed",
            Phase::Rejected => "rejected",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Bookkeeping of one call, owned by whichever part of the proxy currently drives it.
#[derive(Debug)]
pub(crate) struct CallState {
    method: String,
    phase: Phase,
    headers_flushed: bool,
    trailers: MetadataMap,
}

impl CallState {
    pub(crate) fn new(method: String) -> Self {
        Self {
            method,
            phase: Phase::Init,
            headers_flushed: false,
            trailers: MetadataMap::new(),
        }
    }

    pub(crate) fn method(&self) -> &str {
        &self.method
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn transition(&mut self, next: Phase) {
        debug_assert!(
            !self.phase.is_terminal(),
            "call already reached {}",
            self.phase
        );
        tracing::trace!(method = %self.method, from = %self.phase, to = %next, "call phase");
        self.phase = next;
    }

    /// Records that the response headers were handed to the caller.
    pub(crate) fn headers_flushed(&mut self) {
        debug_assert!(!self.headers_flushed, "response headers flushed twice");
        self.headers_flushed = true;
    }

    pub(crate) fn are_headers_flushed(&self) -> bool {
        self.headers_flushed
    }

    pub(crate) fn set_trailers(&mut self, trailers: MetadataMap) {
        self.trailers = trailers;
    }

    pub(crate) fn take_trailers(&mut self) -> MetadataMap {
        std::mem::take(&mut self.trailers)
    }
}

/// The completion and failure flag shared by the two pumps of a call.
///
/// Cancelling it stops both pumps. The first failure recorded wins and becomes the
/// status of the call.
#[derive(Debug, Clone)]
pub(crate) struct CallSignal {
    token: CancellationToken,
    failure: Arc<OnceLock<Status>>,
}

impl CallSignal {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self {
            token,
            failure: Arc::new(OnceLock::new()),
        }
    }

    /// Records `status` as the failure of the call, unless one was already recorded,
    /// and stops both pumps.
    pub(crate) fn fail(&self, status: Status) {
        let _ = self.failure.set(status);
        self.token.cancel();
    }

    /// Stops both pumps without failing the call.
    pub(crate) fn finish(&self) {
        self.token.cancel();
    }

    pub(crate) fn failure(&self) -> Option<Status> {
        self.failure.get().cloned()
    }

    /// The recorded failure, or `Cancelled` when the call was stopped without one.
    pub(crate) fn failure_or_cancelled(&self) -> Status {
        self.failure()
            .unwrap_or_else(|| Status::cancelled("call was cancelled"))
    }

    #[cfg(test)]
    pub(crate) fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Stops the call when the returned guard is dropped without being disarmed.
    pub(crate) fn stop_on_drop(&self) -> DropGuard {
        self.token.clone().drop_guard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn first_failure_wins() {
        let signal = CallSignal::new(CancellationToken::new());
        assert!(!signal.is_stopped());

        signal.fail(Status::unavailable("backend went away"));
        signal.fail(Status::cancelled("late"));

        assert!(signal.is_stopped());
        assert_eq!(signal.failure().map(|s| s.code()), Some(Code::Unavailable));
    }

    #[test]
    fn finishing_is_not_a_failure() {
        let signal = CallSignal::new(CancellationToken::new());
        signal.finish();

        assert!(signal.is_stopped());
        assert!(signal.failure().is_none());
        assert_eq!(signal.failure_or_cancelled().code(), Code::Cancelled);
    }

    #[test]
    fn dropping_the_guard_stops_the_call() {
        let signal = CallSignal::new(CancellationToken::new());
        drop(signal.stop_on_drop());
        assert!(signal.is_stopped());

        let signal = CallSignal::new(CancellationToken::new());
        let _ = signal.stop_on_drop().disarm();
        assert!(!signal.is_stopped());
    }

    #[test]
    fn phases() {
        let mut state = CallState::new("/ping.v1.TestService/Ping".to_string());
        assert_eq!(state.phase(), Phase::Init);

        state.transition(Phase::Routing);
        state.transition(Phase::Streaming);
        state.headers_flushed();
        state.transition(Phase::Draining);
        state.transition(Phase::Closed);

        assert!(state.phase().is_terminal());
        assert!(state.are_headers_flushed());
        assert_eq!(state.method(), "/ping.v1.TestService/Ping");
    }

    #[test]
    fn calls_can_end_before_streaming() {
        let mut malformed = CallState::new("/a/b/c".to_string());
        malformed.transition(Phase::Rejected);
        assert!(malformed.phase().is_terminal());

        let mut expired = CallState::new("/ping.v1.TestService/Ping".to_string());
        expired.transition(Phase::Routing);
        expired.transition(Phase::Failed);
        assert_eq!(expired.phase(), Phase::Failed);
        assert!(!expired.are_headers_flushed());
    }
}
