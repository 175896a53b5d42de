//! Message delivery lifecycle: the status state machine and the retry
//! policy for outbound sends.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Position of a message in its lifecycle. Transitions only ever move
/// forward; stale or replayed status events are ignored (see [`advance`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Local-only, before the send request is issued. Covers attachment
    /// upload time.
    Composing,
    /// Send request issued, no server acknowledgement yet.
    Sending,
    /// Server accepted the message and assigned its permanent id.
    Sent,
    /// The recipient's client acknowledged receipt.
    Delivered,
    /// The recipient viewed the message.
    Read,
    /// Send gave up (validation rejection, or retry budget exhausted).
    /// Manual retry re-enters `Sending`.
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Composing => "composing",
            DeliveryStatus::Sending => "sending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
        }
    }

    /// Forward progress rank. `Failed` sits outside the happy path and is
    /// handled separately in [`advance`].
    fn rank(self) -> u8 {
        match self {
            DeliveryStatus::Composing => 0,
            DeliveryStatus::Sending => 1,
            DeliveryStatus::Sent => 2,
            DeliveryStatus::Delivered => 3,
            DeliveryStatus::Read => 4,
            DeliveryStatus::Failed => 1,
        }
    }

    pub fn is_terminal_failure(self) -> bool {
        matches!(self, DeliveryStatus::Failed)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<String> for DeliveryStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "composing" => DeliveryStatus::Composing,
            "sending" => DeliveryStatus::Sending,
            "delivered" => DeliveryStatus::Delivered,
            "read" => DeliveryStatus::Read,
            "failed" => DeliveryStatus::Failed,
            _ => DeliveryStatus::Sent,
        }
    }
}

/// Applies a status event on top of the current status, enforcing the
/// forward-only state machine:
///
/// - the happy path never regresses (`read` followed by a stale `sent`
///   stays `read`; `read` before `delivered` collapses both);
/// - `Failed` is reachable only from the pre-acknowledgement states
///   (`Composing` during a failed upload, `Sending` after a failed
///   submit);
/// - a manual retry moves `Failed` back to `Sending`.
///
/// The result is idempotent under duplicate or replayed events, which the
/// push channel produces after reconnects.
pub fn advance(current: DeliveryStatus, incoming: DeliveryStatus) -> DeliveryStatus {
    use DeliveryStatus::*;
    match (current, incoming) {
        (Composing | Sending, Failed) => Failed,
        (Failed, Sending) => Sending,
        (Failed, _) | (_, Failed) => current,
        _ => {
            if incoming.rank() > current.rank() {
                incoming
            } else {
                current
            }
        }
    }
}

/// Bounded retry for outbound sends. Transient failures (connection drops,
/// timeouts) retry up to `max_attempts` with a linear backoff; validation
/// and permanent rejections never retry.
#[derive(Debug, Clone)]
pub struct SendRetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Deadline for a single submit attempt before it counts as a
    /// transient failure.
    pub attempt_timeout: Duration,
}

impl Default for SendRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl SendRetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}
