//! Session counters and the rolling processing rate.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime};

/// Window over which the processing rate is measured.
pub const FPS_WINDOW: Duration = Duration::from_secs(1);

/// Observable counters for one client session.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SessionMetrics {
    /// Results received per second over the last `FPS_WINDOW`.
    pub fps: f32,
    #[serde(skip)]
    pub last_update: Option<SystemTime>,
    pub last_error: Option<String>,
    pub frames_sent: u64,
    /// Ticks dropped because a request was still outstanding.
    pub ticks_dropped: u64,
    /// Ticks skipped because no frame could be encoded.
    pub ticks_skipped: u64,
    pub results_received: u64,
    pub malformed_messages: u64,
    pub reconnect_attempts: u64,
}

#[derive(Debug, Default)]
pub struct MetricsTracker {
    metrics: SessionMetrics,
    arrivals: VecDeque<Instant>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SessionMetrics {
        self.metrics.clone()
    }

    pub fn get(&self) -> &SessionMetrics {
        &self.metrics
    }

    pub fn record_result(&mut self, now: Instant) {
        self.metrics.results_received += 1;
        self.metrics.last_update = Some(SystemTime::now());
        self.arrivals.push_back(now);
        self.refresh_fps(now);
    }

    /// Recompute the rate without recording an arrival, so it decays to
    /// zero once results stop.
    pub fn refresh_fps(&mut self, now: Instant) {
        while let Some(oldest) = self.arrivals.front() {
            if now.saturating_duration_since(*oldest) >= FPS_WINDOW {
                self.arrivals.pop_front();
            } else {
                break;
            }
        }
        self.metrics.fps = self.arrivals.len() as f32 / FPS_WINDOW.as_secs_f32();
    }

    pub fn record_sent(&mut self) {
        self.metrics.frames_sent += 1;
    }

    pub fn record_dropped(&mut self) {
        self.metrics.ticks_dropped += 1;
    }

    pub fn record_skipped(&mut self) {
        self.metrics.ticks_skipped += 1;
    }

    pub fn record_malformed(&mut self) {
        self.metrics.malformed_messages += 1;
    }

    pub fn record_reconnect(&mut self) {
        self.metrics.reconnect_attempts += 1;
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.metrics.last_error = Some(message.into());
    }

    pub fn clear_error(&mut self) {
        self.metrics.last_error = None;
    }
}
