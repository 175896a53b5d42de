//! Heartbeat bookkeeping for the persistent channel. The connection actor
//! drives this from its select loop: it sleeps until [`KeepaliveState::deadline`],
//! then acts on [`KeepaliveState::on_deadline`].

use log::{info, warn};
use rand::Rng;
use tokio::time::{Duration, Instant};

const KEEP_ALIVE_INTERVAL_MIN: Duration = Duration::from_secs(20);
const KEEP_ALIVE_INTERVAL_MAX: Duration = Duration::from_secs(30);
const KEEP_ALIVE_RESPONSE_DEADLINE: Duration = Duration::from_secs(20);
const KEEP_ALIVE_MAX_FAIL_TIME: Duration = Duration::from_secs(180); // 3 minutes

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeepaliveAction {
    /// Time to send a ping frame.
    SendPing,
    /// Pongs have been failing for longer than the tolerated window; tear
    /// the connection down so the reconnect cycle can take over.
    ForceReconnect,
    /// Deadline fired but nothing to do yet (e.g. a pong miss that is
    /// still within the tolerated window).
    Idle,
}

#[derive(Debug)]
pub(crate) struct KeepaliveState {
    next_ping_at: Instant,
    awaiting_pong_since: Option<Instant>,
    last_success: Instant,
    error_count: u32,
}

fn random_interval() -> Duration {
    let interval_ms = rand::rng().random_range(
        KEEP_ALIVE_INTERVAL_MIN.as_millis()..=KEEP_ALIVE_INTERVAL_MAX.as_millis(),
    );
    Duration::from_millis(interval_ms as u64)
}

impl KeepaliveState {
    pub(crate) fn new() -> Self {
        let now = Instant::now();
        Self {
            next_ping_at: now + random_interval(),
            awaiting_pong_since: None,
            last_success: now,
            error_count: 0,
        }
    }

    /// The next instant the connection loop has to wake up for.
    pub(crate) fn deadline(&self) -> Instant {
        match self.awaiting_pong_since {
            Some(since) => self.next_ping_at.min(since + KEEP_ALIVE_RESPONSE_DEADLINE),
            None => self.next_ping_at,
        }
    }

    pub(crate) fn on_deadline(&mut self) -> KeepaliveAction {
        let now = Instant::now();

        if let Some(since) = self.awaiting_pong_since
            && now >= since + KEEP_ALIVE_RESPONSE_DEADLINE
        {
            self.awaiting_pong_since = None;
            self.error_count += 1;
            warn!(target: "Connection/Keepalive", "Keepalive timeout, error count: {}", self.error_count);
            if now.duration_since(self.last_success) > KEEP_ALIVE_MAX_FAIL_TIME {
                warn!(
                    target: "Connection/Keepalive",
                    "Forcing reconnect due to keepalive failure for over {} seconds.",
                    KEEP_ALIVE_MAX_FAIL_TIME.as_secs()
                );
                return KeepaliveAction::ForceReconnect;
            }
        }

        if now >= self.next_ping_at {
            self.next_ping_at = now + random_interval();
            self.awaiting_pong_since = Some(now);
            return KeepaliveAction::SendPing;
        }

        KeepaliveAction::Idle
    }

    pub(crate) fn on_pong(&mut self) {
        if self.error_count > 0 {
            info!(target: "Connection/Keepalive", "Keepalive restored.");
        }
        self.awaiting_pong_since = None;
        self.last_success = Instant::now();
        self.error_count = 0;
    }
}
