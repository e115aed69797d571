use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_LATENCY: Duration = Duration::from_millis(500);

/// What the heartbeat timer should do on a tick.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TickAction {
    Nothing,
    SendPing,
    /// The in-flight ping ran past the timeout; notify once.
    ReportTimeout,
}

/// Outcome of a received `Pong`, used to drive latency notifications.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct PongOutcome {
    pub latency_ms: u64,
    pub latency_changed: bool,
    /// Crossed into high latency on this measurement (debounced).
    pub high_latency_entered: bool,
}

/// Heartbeat bookkeeping, guarded by the channel's heartbeat monitor.
///
/// Pure state: the surrounding task clock calls `on_tick`/`on_pong` and
/// performs the resulting I/O and event emission outside the lock.
pub(crate) struct HeartbeatState {
    pub interval: Duration,
    pub timeout: Duration,
    pub max_latency: Duration,
    pending: bool,
    timed_out: bool,
    sent_at: Option<Instant>,
    latency_ms: u64,
    high_latency: bool,
}

impl HeartbeatState {
    pub fn new(interval: Duration, timeout: Duration, max_latency: Duration) -> Self {
        HeartbeatState {
            interval,
            timeout,
            max_latency,
            pending: false,
            timed_out: false,
            sent_at: None,
            latency_ms: 0,
            high_latency: false,
        }
    }

    /// The timer period: ticks must be frequent enough to observe both the
    /// send interval and the timeout.
    pub fn tick_period(&self) -> Duration {
        self.interval.min(self.timeout)
    }

    /// `latency = 0` is the no-data sentinel, not a measurement.
    pub fn latency_ms(&self) -> u64 {
        self.latency_ms
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn on_tick(&mut self, now: Instant, stable: bool) -> TickAction {
        if !stable {
            return TickAction::Nothing;
        }
        let sent_at = match self.sent_at {
            Some(instant) => instant,
            None => {
                // First tick after start: nothing has been sent yet.
                self.pending = true;
                self.timed_out = false;
                self.sent_at = Some(now);
                return TickAction::SendPing;
            }
        };
        if self.pending {
            if now.duration_since(sent_at) > self.timeout && !self.timed_out {
                self.timed_out = true;
                return TickAction::ReportTimeout;
            }
            return TickAction::Nothing;
        }
        if now.duration_since(sent_at) >= self.interval {
            self.pending = true;
            self.timed_out = false;
            self.sent_at = Some(now);
            return TickAction::SendPing;
        }
        TickAction::Nothing
    }

    pub fn on_pong(&mut self, now: Instant) -> Option<PongOutcome> {
        let sent_at = self.sent_at?;
        if !self.pending {
            return None;
        }
        self.pending = false;
        self.timed_out = false;
        let latency = now.duration_since(sent_at);
        let latency_ms = (latency.as_millis() as u64).max(1);
        let latency_changed = latency_ms != self.latency_ms;
        self.latency_ms = latency_ms;
        let high = latency > self.max_latency;
        let high_latency_entered = high && !self.high_latency;
        self.high_latency = high;
        Some(PongOutcome {
            latency_ms,
            latency_changed,
            high_latency_entered,
        })
    }

    /// Reset to the stopped shape: no pending ping, latency back to the
    /// no-data sentinel.
    pub fn reset(&mut self) {
        self.pending = false;
        self.timed_out = false;
        self.sent_at = None;
        self.latency_ms = 0;
        self.high_latency = false;
    }
}
