//! Request/response correlation for engine commands.
//!
//! The engine does not answer commands positionally: replies can arrive in
//! any order, interleaved with status lines. Each outgoing command therefore
//! carries a correlation token that the engine echoes back, and the
//! correlator matches replies to the request that caused them.
//!
//! Tokens come from a process-local monotonic counter rather than the wall
//! clock, so rapid issuance cannot collide. The correlator is owned by the
//! supervisor loop: register, resolve, and sweep all run on that single
//! logical owner and are therefore mutually exclusive.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

/// A matched reply to a previously sent command.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Reply action name, e.g. `strategy_result`.
    pub action: String,
    /// The full reply object as emitted by the engine.
    pub payload: serde_json::Value,
}

/// Error type for a single command's outcome.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// No reply arrived before the command's deadline.
    #[error("Command timed out waiting for engine reply")]
    Timeout,
    /// The engine exited while the command was in flight.
    #[error("Engine crashed with command in flight")]
    WorkerCrashed,
    /// The supervisor is shutting down.
    #[error("Supervisor is shutting down")]
    ShuttingDown,
    /// The supervisor is not in a state that accepts commands.
    #[error("Engine is not ready for commands")]
    NotReady,
    /// The command frame could not be written to the engine's stdin.
    #[error("Engine stdin pipe is closed")]
    ClosedPipe,
    /// Writing the command frame failed with an I/O error other than a
    /// closed pipe.
    #[error("Failed to write command to engine: {0}")]
    WriteFailed(String),
}

struct Pending {
    created_at: Instant,
    deadline: Instant,
    tx: oneshot::Sender<Result<Reply, CommandError>>,
}

/// Tracks in-flight commands and resolves them by token.
pub struct Correlator {
    pending: HashMap<u64, Pending>,
    next_token: u64,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            next_token: 1,
        }
    }

    /// Number of requests currently in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if no requests are in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Allocate a fresh token and record a pending request.
    ///
    /// The caller keeps the receiving half of `tx` as its future; the
    /// request is resolved through it exactly once, on reply or timeout.
    pub fn register(
        &mut self,
        timeout: Duration,
        tx: oneshot::Sender<Result<Reply, CommandError>>,
    ) -> u64 {
        let token = self.next_token;
        self.next_token += 1;

        let now = Instant::now();
        self.pending.insert(
            token,
            Pending {
                created_at: now,
                deadline: now + timeout,
                tx,
            },
        );
        token
    }

    /// Resolve the pending request with the given token.
    ///
    /// Returns true if a request was matched. A late, duplicate, or
    /// unsolicited token is discarded and logged at debug level only.
    pub fn resolve(&mut self, token: u64, reply: Reply) -> bool {
        match self.pending.remove(&token) {
            Some(entry) => {
                tracing::debug!(
                    token,
                    action = %reply.action,
                    latency_ms = u64::try_from(entry.created_at.elapsed().as_millis())
                        .unwrap_or(u64::MAX),
                    "Reply matched to pending request"
                );
                // The caller may have dropped its receiver; that is fine.
                let _ = entry.tx.send(Ok(reply));
                true
            }
            None => {
                tracing::debug!(token, action = %reply.action, "Discarding unmatched reply");
                false
            }
        }
    }

    /// Fail a single pending request, removing it.
    ///
    /// Used when the command frame could not be transmitted after the
    /// request was registered.
    pub fn fail(&mut self, token: u64, error: CommandError) {
        if let Some(entry) = self.pending.remove(&token) {
            let _ = entry.tx.send(Err(error));
        }
    }

    /// Fail every request whose deadline has passed.
    ///
    /// Returns the number of requests timed out.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(&token, _)| token)
            .collect();

        for token in &expired {
            if let Some(entry) = self.pending.remove(token) {
                tracing::warn!(token, "Command timed out");
                let _ = entry.tx.send(Err(CommandError::Timeout));
            }
        }
        expired.len()
    }

    /// Fail every in-flight request with the given error.
    ///
    /// Used when the engine crashes or the supervisor shuts down; no request
    /// is left to wait out its own deadline.
    pub fn fail_all(&mut self, error: &CommandError) -> usize {
        let count = self.pending.len();
        for (token, entry) in self.pending.drain() {
            tracing::debug!(token, error = %error, "Failing in-flight request");
            let _ = entry.tx.send(Err(error.clone()));
        }
        count
    }
}
