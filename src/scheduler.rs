//! Capture tick scheduling.
//!
//! Ticks fire at a fixed period while capture runs. A tick that comes due
//! late is fired once and the schedule re-anchors on the current instant, so
//! a stalled driver never produces a burst of catch-up captures.

use std::time::{Duration, Instant};

/// Default capture rate in frames per second.
pub const DEFAULT_TARGET_FPS: u32 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickDecision {
    Capture,
    /// The previous send has not left the client yet; the tick is dropped.
    Backpressure,
}

#[derive(Debug)]
pub struct CaptureScheduler {
    period: Duration,
    next_tick: Option<Instant>,
}

impl CaptureScheduler {
    /// Rates below 1 fps are raised to 1 fps.
    pub fn new(target_fps: u32) -> Self {
        let fps = target_fps.max(1);
        Self {
            period: Duration::from_secs(1) / fps,
            next_tick: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Start ticking; the first tick is due immediately.
    pub fn start(&mut self, now: Instant) {
        self.next_tick = Some(now);
    }

    pub fn stop(&mut self) {
        self.next_tick = None;
    }

    pub fn is_running(&self) -> bool {
        self.next_tick.is_some()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_tick
    }

    /// Returns true when a tick is due at `now`, advancing the schedule.
    pub fn poll_tick(&mut self, now: Instant) -> bool {
        let Some(due) = self.next_tick else {
            return false;
        };
        if now < due {
            return false;
        }
        let next = due + self.period;
        self.next_tick = Some(if next <= now { now + self.period } else { next });
        true
    }

    /// Decide whether a due tick may capture. Frames are never queued behind
    /// an outstanding send.
    pub fn admit(in_flight: bool) -> TickDecision {
        if in_flight {
            TickDecision::Backpressure
        } else {
            TickDecision::Capture
        }
    }
}
