//! Per-session cancellation root.
//!
//! Every way a session can die — client disconnect, duration timeout, policy
//! revocation, delegate reject, setup failure — funnels into one
//! [`SessionContext`]. The first close wins: its termination reason is the
//! one reported, and later closes are no-ops. Watchdogs hold the context,
//! never the session record.

use std::sync::Mutex;

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Why a session was terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    /// Shown to the client before teardown, when present.
    pub message: Option<String>,
    /// Internal reason for the log line.
    pub reason: &'static str,
}

impl Termination {
    /// Silent termination (normal session end, client disconnect).
    pub fn silent(reason: &'static str) -> Self {
        Self { message: None, reason }
    }

    /// Termination with a user-visible message.
    pub fn with_message(reason: &'static str, message: impl Into<String>) -> Self {
        Self { message: Some(message.into()), reason }
    }
}

/// Cancellation root for one session.
#[derive(Debug, Default)]
pub struct SessionContext {
    token: CancellationToken,
    cause: Mutex<Option<Termination>>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the session with `cause`. Returns `true` if this call was the
    /// one that closed it; the recorded cause never changes afterwards.
    pub fn close(&self, cause: Termination) -> bool {
        let mut guard = self.cause.lock().unwrap();
        if guard.is_some() {
            return false;
        }
        *guard = Some(cause);
        drop(guard);
        self.token.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the session is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// The raw cancellation token, for code that only needs to observe
    /// cancellation (delegate fetches, pumps).
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// The first-recorded termination cause, if any.
    pub fn cause(&self) -> Option<Termination> {
        self.cause.lock().unwrap().clone()
    }
}
