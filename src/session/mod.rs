//! Session controller: the client lifecycle state machine.
//!
//! ```text
//! Idle --start--> Connecting --opened--> Connected --capture--> Streaming
//! Streaming --stop--> Connected (stream) | Disconnected (request)
//! {Connecting, Connected, Streaming} --transport error--> Erroring --policy--> Connecting | Disconnected
//! any --close--> Idle
//! ```
//!
//! The controller owns exactly one frame source and one transport. Every
//! event (command, capture tick, transport event, retry deadline) is handled
//! to completion on the caller's thread; callers pass `now` explicitly so the
//! timing rules can be driven deterministically.
//!
//! Leaving `Streaming` always stops the scheduler and closes the source,
//! whatever the cause.

use anyhow::Result;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::admin::{ServiceStatus, StatisticsAdmin};
use crate::detection::{ClassCounts, DetectionResult};
use crate::frame::FrameEncoder;
use crate::ingest::{CaptureConstraints, FrameSource};
use crate::metrics::{MetricsTracker, SessionMetrics};
use crate::scheduler::{CaptureScheduler, TickDecision};
use crate::transport::{
    InboundMessage, OutboundMessage, Transport, TransportError, TransportEvent, TransportMode,
};

mod reconnect;
mod state;

pub use reconnect::{ReconnectPolicy, DEFAULT_RECONNECT_DELAY};
pub use state::{ConnectionState, SessionSnapshot};

/// Session tuning.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    pub constraints: CaptureConstraints,
    pub target_fps: u32,
    /// JPEG quality in `(0, 1]`.
    pub jpeg_quality: f32,
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            constraints: CaptureConstraints::default(),
            target_fps: crate::scheduler::DEFAULT_TARGET_FPS,
            jpeg_quality: crate::frame::DEFAULT_JPEG_QUALITY,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

pub struct SessionController<T: Transport, S: FrameSource> {
    transport: T,
    source: S,
    encoder: FrameEncoder,
    scheduler: CaptureScheduler,
    constraints: CaptureConstraints,
    reconnect: ReconnectPolicy,
    state: ConnectionState,
    capture_requested: bool,
    stop_requested: bool,
    retry_attempt: u32,
    retry_due: Option<Instant>,
    detection: Option<DetectionResult>,
    current_counts: ClassCounts,
    cumulative_statistics: ClassCounts,
    annotated_image: Option<Arc<[u8]>>,
    service: Option<ServiceStatus>,
    metrics: MetricsTracker,
    observers: Vec<Sender<SessionSnapshot>>,
}

impl<T: Transport, S: FrameSource> SessionController<T, S> {
    pub fn new(config: SessionConfig, transport: T, source: S) -> Result<Self> {
        let encoder = FrameEncoder::new(config.jpeg_quality)?;
        Ok(Self {
            transport,
            source,
            encoder,
            scheduler: CaptureScheduler::new(config.target_fps),
            constraints: config.constraints,
            reconnect: config.reconnect,
            state: ConnectionState::Idle,
            capture_requested: false,
            stop_requested: false,
            retry_attempt: 0,
            retry_due: None,
            detection: None,
            current_counts: ClassCounts::ZERO,
            cumulative_statistics: ClassCounts::ZERO,
            annotated_image: None,
            service: None,
            metrics: MetricsTracker::new(),
            observers: Vec::new(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn mode(&self) -> TransportMode {
        self.transport.mode()
    }

    pub fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn metrics(&self) -> &SessionMetrics {
        self.metrics.get()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            detection: self.detection.clone(),
            current_counts: self.current_counts,
            cumulative_statistics: self.cumulative_statistics,
            annotated_image: self.annotated_image.clone(),
            metrics: self.metrics.snapshot(),
            service: self.service.clone(),
        }
    }

    /// Register an observer. The current snapshot is delivered immediately,
    /// then one per published change. Dropped receivers are pruned.
    pub fn subscribe(&mut self) -> Receiver<SessionSnapshot> {
        let (tx, rx) = mpsc::channel();
        if tx.send(self.snapshot()).is_ok() {
            self.observers.push(tx);
        }
        rx
    }

    /// Earliest instant at which `on_tick` or `poll_retry` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.scheduler.next_deadline(), self.retry_due) {
            (Some(tick), Some(retry)) => Some(tick.min(retry)),
            (tick, retry) => tick.or(retry),
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Connect (if needed) and begin capturing.
    pub fn start(&mut self, now: Instant) {
        self.stop_requested = false;
        self.capture_requested = true;
        match self.state {
            ConnectionState::Idle | ConnectionState::Disconnected => {
                self.retry_attempt = 0;
                self.connect(now);
            }
            ConnectionState::Connected => self.begin_capture(now),
            ConnectionState::Connecting
            | ConnectionState::Streaming
            | ConnectionState::Erroring => {}
        }
    }

    /// Stop capturing. In stream mode a streaming session stays connected;
    /// everything else ends `Disconnected`.
    pub fn stop(&mut self) {
        self.stop_requested = true;
        self.capture_requested = false;
        self.retry_due = None;
        match self.state {
            ConnectionState::Streaming => {
                self.end_capture();
                match self.transport.mode() {
                    TransportMode::Stream => {
                        if let Err(err) = self.transport.send_control(&OutboundMessage::StopStream)
                        {
                            log::debug!("SessionController: stop_stream not delivered: {}", err);
                        }
                        self.set_state(ConnectionState::Connected);
                    }
                    TransportMode::Request => {
                        self.transport.close();
                        self.set_state(ConnectionState::Disconnected);
                    }
                }
            }
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Erroring => {
                self.transport.close();
                self.set_state(ConnectionState::Disconnected);
            }
            ConnectionState::Idle | ConnectionState::Disconnected => {}
        }
    }

    /// Tear the session down from any state. Events that arrive afterwards
    /// are discarded.
    pub fn close(&mut self) {
        self.stop_requested = true;
        self.capture_requested = false;
        self.retry_due = None;
        self.end_capture();
        self.transport.close();
        if self.state != ConnectionState::Idle {
            self.set_state(ConnectionState::Idle);
        }
    }

    /// Blocking convenience around `on_statistics_reset`.
    pub fn reset_statistics(&mut self, admin: &dyn StatisticsAdmin) {
        let outcome = admin.reset_statistics();
        self.on_statistics_reset(outcome);
    }

    /// Apply the outcome of a statistics reset. Success zeroes both count
    /// blocks immediately.
    pub fn on_statistics_reset(&mut self, outcome: Result<(), TransportError>) {
        match outcome {
            Ok(()) => {
                log::info!("SessionController: statistics reset");
                self.current_counts = ClassCounts::ZERO;
                self.cumulative_statistics = ClassCounts::ZERO;
                if let Some(detection) = self.detection.as_mut() {
                    detection.current_counts = ClassCounts::ZERO;
                    detection.cumulative_statistics = ClassCounts::ZERO;
                }
            }
            Err(err) => {
                log::warn!("SessionController: statistics reset failed: {}", err);
                self.metrics.record_error(err.to_string());
            }
        }
        self.publish();
    }

    pub fn set_service_status(&mut self, outcome: Result<ServiceStatus, TransportError>) {
        match outcome {
            Ok(status) => {
                log::info!(
                    "SessionController: service {} (model loaded: {})",
                    status.status,
                    status.model_loaded
                );
                self.service = Some(status);
            }
            Err(err) => {
                log::warn!("SessionController: status query failed: {}", err);
                self.metrics.record_error(err.to_string());
            }
        }
        self.publish();
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Run one capture cycle if a tick is due.
    pub fn on_tick(&mut self, now: Instant) {
        self.metrics.refresh_fps(now);
        if self.state != ConnectionState::Streaming || !self.scheduler.poll_tick(now) {
            return;
        }

        let decision = CaptureScheduler::admit(self.transport.in_flight());
        if decision == TickDecision::Backpressure {
            log::debug!("SessionController: previous send outstanding, dropping tick");
            self.metrics.record_dropped();
            return;
        }
        if !self.transport.is_open() {
            log::debug!("SessionController: transport not sendable, skipping tick");
            self.metrics.record_skipped();
            return;
        }

        let encoded = match self.source.surface() {
            Ok(surface) => Ok(self.encoder.encode(&surface)),
            Err(err) => Err(err),
        };
        let frame = match encoded {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::debug!("SessionController: surface not ready, skipping tick");
                self.metrics.record_skipped();
                return;
            }
            Err(err) => {
                log::warn!("SessionController: capture failed: {}", err);
                self.end_capture();
                self.capture_requested = false;
                self.metrics.record_error(err.to_string());
                self.set_state(ConnectionState::Connected);
                return;
            }
        };

        match self.transport.send(frame) {
            Ok(()) => self.metrics.record_sent(),
            Err(err) => self.on_transport_failure(err, now),
        }
    }

    /// Reconnect once the backoff has elapsed, unless stop was requested.
    pub fn poll_retry(&mut self, now: Instant) {
        if self.state != ConnectionState::Erroring {
            return;
        }
        match self.retry_due {
            Some(due) if now >= due => {}
            _ => return,
        }
        self.retry_due = None;
        if self.stop_requested {
            self.set_state(ConnectionState::Disconnected);
            return;
        }
        log::info!(
            "SessionController: reconnect attempt {}",
            self.retry_attempt
        );
        self.metrics.record_reconnect();
        self.connect(now);
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    /// Wait up to `timeout` for one transport event and handle it.
    /// Returns true if an event was handled.
    pub fn pump(&mut self, timeout: Duration) -> bool {
        match self.transport.poll(timeout) {
            Some(event) => {
                self.handle_transport_event(event, Instant::now());
                true
            }
            None => false,
        }
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        if matches!(
            self.state,
            ConnectionState::Idle | ConnectionState::Disconnected
        ) {
            log::debug!(
                "SessionController: discarding {} while {}",
                event_name(&event),
                self.state
            );
            return;
        }

        match event {
            TransportEvent::Opened => self.on_opened(now),
            TransportEvent::Message(InboundMessage::Detection(result))
            | TransportEvent::Response(Ok(result)) => self.apply_result(result, now),
            TransportEvent::Message(InboundMessage::Error(message)) => {
                self.on_transport_failure(TransportError::RemoteError(message), now)
            }
            TransportEvent::Message(InboundMessage::Info(message)) => {
                log::info!("SessionController: service says: {}", message);
            }
            TransportEvent::Message(InboundMessage::Unknown(kind)) => {
                log::debug!("SessionController: ignoring message type '{}'", kind);
            }
            TransportEvent::Response(Err(err)) | TransportEvent::Failed(err) => {
                self.on_transport_failure(err, now)
            }
            TransportEvent::Closed => self.on_closed(now),
        }
    }

    fn on_opened(&mut self, now: Instant) {
        if self.state != ConnectionState::Connecting {
            log::debug!("SessionController: ignoring open while {}", self.state);
            return;
        }
        self.retry_attempt = 0;
        self.metrics.clear_error();
        self.set_state(ConnectionState::Connected);
        if self.capture_requested && !self.stop_requested {
            self.begin_capture(now);
        }
    }

    fn apply_result(&mut self, result: DetectionResult, now: Instant) {
        if !self.state.is_live() {
            log::debug!("SessionController: discarding result while {}", self.state);
            return;
        }
        self.current_counts = result.current_counts;
        self.cumulative_statistics = result.cumulative_statistics;
        if let Some(image) = &result.annotated_image {
            self.annotated_image = Some(Arc::clone(image));
        }
        self.detection = Some(result);
        self.metrics.record_result(now);
        self.publish();
    }

    fn on_transport_failure(&mut self, err: TransportError, now: Instant) {
        match err {
            TransportError::MalformedMessage(reason) => {
                log::warn!("SessionController: dropping malformed message: {}", reason);
                self.metrics.record_malformed();
            }
            TransportError::RemoteError(message) => {
                log::warn!("SessionController: service error: {}", message);
                self.metrics.record_error(message);
                self.publish();
            }
            // The frame was refused locally; the channel itself is intact.
            TransportError::SendFailed(reason) => {
                log::warn!("SessionController: frame not sent: {}", reason);
                self.metrics.record_error(reason);
                self.publish();
            }
            err if self.transport.mode() == TransportMode::Request => {
                log::warn!("SessionController: request failed: {}", err);
                self.metrics.record_error(err.to_string());
                self.publish();
            }
            err => {
                log::warn!("SessionController: transport failed: {}", err);
                self.end_capture();
                self.transport.close();
                self.metrics.record_error(err.to_string());
                self.set_state(ConnectionState::Erroring);
                self.schedule_retry(now);
            }
        }
    }

    fn on_closed(&mut self, now: Instant) {
        self.end_capture();
        self.transport.close();
        if self.capture_requested && !self.stop_requested {
            self.metrics.record_error("connection closed by service");
            self.set_state(ConnectionState::Erroring);
            self.schedule_retry(now);
        } else {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn connect(&mut self, now: Instant) {
        self.set_state(ConnectionState::Connecting);
        if let Err(err) = self.transport.open() {
            self.on_transport_failure(err, now);
        }
    }

    fn begin_capture(&mut self, now: Instant) {
        match self.source.open(&self.constraints) {
            Ok(()) => {
                if let Some((width, height)) = self.source.dimensions() {
                    log::info!(
                        "SessionController: capturing {} at {}x{}",
                        self.source.name(),
                        width,
                        height
                    );
                }
                self.scheduler.start(now);
                self.set_state(ConnectionState::Streaming);
            }
            Err(err) => {
                log::warn!("SessionController: camera unavailable: {}", err);
                self.source.close();
                self.capture_requested = false;
                self.metrics.record_error(err.to_string());
                self.publish();
            }
        }
    }

    fn end_capture(&mut self) {
        self.scheduler.stop();
        self.source.close();
    }

    fn schedule_retry(&mut self, now: Instant) {
        if self.stop_requested {
            self.set_state(ConnectionState::Disconnected);
            return;
        }
        self.retry_attempt = self.retry_attempt.saturating_add(1);
        match self.reconnect.next_delay(self.retry_attempt) {
            Some(delay) => {
                log::info!(
                    "SessionController: retrying in {:?} (attempt {})",
                    delay,
                    self.retry_attempt
                );
                self.retry_due = Some(now + delay);
            }
            None => {
                log::warn!(
                    "SessionController: giving up after {} attempts",
                    self.retry_attempt - 1
                );
                self.retry_due = None;
                self.capture_requested = false;
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            log::info!("SessionController: {} -> {}", self.state, next);
            self.state = next;
        }
        self.publish();
    }

    fn publish(&mut self) {
        if self.observers.is_empty() {
            return;
        }
        let snapshot = self.snapshot();
        self.observers.retain(|tx| tx.send(snapshot.clone()).is_ok());
    }
}

impl<T: Transport, S: FrameSource> Drop for SessionController<T, S> {
    fn drop(&mut self) {
        self.scheduler.stop();
        self.source.close();
        self.transport.close();
    }
}

fn event_name(event: &TransportEvent) -> &'static str {
    match event {
        TransportEvent::Opened => "opened",
        TransportEvent::Message(_) => "message",
        TransportEvent::Response(_) => "response",
        TransportEvent::Failed(_) => "failure",
        TransportEvent::Closed => "close",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::ingest::SyntheticSource;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// What the fake transport saw, shared with the test body.
    #[derive(Default)]
    struct Wire {
        open: bool,
        open_calls: u32,
        close_calls: u32,
        sent: Vec<usize>,
        controls: Vec<OutboundMessage>,
        in_flight: bool,
        max_in_flight: u32,
        fail_send: Option<TransportError>,
        events: VecDeque<TransportEvent>,
    }

    struct FakeTransport {
        mode: TransportMode,
        wire: Rc<RefCell<Wire>>,
    }

    impl FakeTransport {
        fn new(mode: TransportMode) -> (Self, Rc<RefCell<Wire>>) {
            let wire = Rc::new(RefCell::new(Wire::default()));
            (
                Self {
                    mode,
                    wire: Rc::clone(&wire),
                },
                wire,
            )
        }
    }

    impl Transport for FakeTransport {
        fn mode(&self) -> TransportMode {
            self.mode
        }

        fn endpoint(&self) -> &str {
            "fake://detector"
        }

        fn open(&mut self) -> Result<(), TransportError> {
            let mut wire = self.wire.borrow_mut();
            wire.open = true;
            wire.open_calls += 1;
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.wire.borrow().open
        }

        fn in_flight(&self) -> bool {
            self.wire.borrow().in_flight
        }

        fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
            let mut wire = self.wire.borrow_mut();
            if let Some(err) = wire.fail_send.take() {
                return Err(err);
            }
            wire.sent.push(frame.len());
            if self.mode == TransportMode::Request {
                let outstanding = if wire.in_flight { 2 } else { 1 };
                wire.max_in_flight = wire.max_in_flight.max(outstanding);
                wire.in_flight = true;
            }
            Ok(())
        }

        fn send_control(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
            self.wire.borrow_mut().controls.push(message.clone());
            Ok(())
        }

        fn poll(&mut self, _timeout: Duration) -> Option<TransportEvent> {
            let mut wire = self.wire.borrow_mut();
            let event = wire.events.pop_front();
            if matches!(event, Some(TransportEvent::Response(_))) {
                wire.in_flight = false;
            }
            event
        }

        fn close(&mut self) {
            let mut wire = self.wire.borrow_mut();
            wire.open = false;
            wire.in_flight = false;
            wire.close_calls += 1;
        }
    }

    type Controller = SessionController<FakeTransport, SyntheticSource>;

    fn controller(mode: TransportMode, device: &str) -> (Controller, Rc<RefCell<Wire>>) {
        let (transport, wire) = FakeTransport::new(mode);
        let config = SessionConfig {
            reconnect: ReconnectPolicy::unbounded(Duration::from_millis(500)),
            ..SessionConfig::default()
        };
        let controller = SessionController::new(config, transport, SyntheticSource::new(device))
            .expect("controller");
        (controller, wire)
    }

    fn streaming(mode: TransportMode, device: &str, now: Instant) -> (Controller, Rc<RefCell<Wire>>) {
        let (mut controller, wire) = controller(mode, device);
        controller.start(now);
        controller.handle_transport_event(TransportEvent::Opened, now);
        assert_eq!(controller.state(), ConnectionState::Streaming);
        (controller, wire)
    }

    fn result(current: ClassCounts, cumulative: ClassCounts) -> DetectionResult {
        DetectionResult {
            detected: true,
            class_label: "sin_chaleco".to_string(),
            confidence: 0.9,
            current_counts: current,
            cumulative_statistics: cumulative,
            annotated_image: Some(Arc::from(&[0xFFu8, 0xD8][..])),
        }
    }

    #[test]
    fn start_then_one_tick_sends_exactly_one_frame() {
        let t0 = Instant::now();
        let (mut controller, wire) = controller(TransportMode::Stream, "stub://camera");
        assert_eq!(controller.state(), ConnectionState::Idle);

        controller.start(t0);
        assert_eq!(controller.state(), ConnectionState::Connecting);
        assert_eq!(wire.borrow().open_calls, 1);

        controller.handle_transport_event(TransportEvent::Opened, t0);
        assert_eq!(controller.state(), ConnectionState::Streaming);
        assert_eq!(controller.source().dimensions(), Some((640, 480)));

        controller.on_tick(t0);
        let sent = wire.borrow().sent.clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0] > 0);
        assert_eq!(controller.metrics().frames_sent, 1);
    }

    #[test]
    fn request_mode_keeps_at_most_one_send_in_flight() {
        let t0 = Instant::now();
        let (mut controller, wire) = streaming(TransportMode::Request, "stub://camera", t0);

        // Ticks every 100 ms, service answers after 350 ms.
        for i in 0..8u64 {
            let now = t0 + Duration::from_millis(i * 100);
            if i == 4 {
                wire.borrow_mut().events.push_back(TransportEvent::Response(Ok(
                    result(ClassCounts::new(0, 1), ClassCounts::new(0, 1)),
                )));
                assert!(controller.pump(Duration::ZERO));
            }
            controller.on_tick(now);
        }

        let wire = wire.borrow();
        assert_eq!(wire.max_in_flight, 1);
        assert_eq!(wire.sent.len(), 2);
        assert_eq!(controller.metrics().ticks_dropped, 6);
    }

    #[test]
    fn stream_mode_allows_overlapping_sends() {
        let t0 = Instant::now();
        let (mut controller, wire) = streaming(TransportMode::Stream, "stub://camera", t0);
        for i in 0..3u64 {
            controller.on_tick(t0 + Duration::from_millis(i * 100));
        }
        assert_eq!(wire.borrow().sent.len(), 3);
        assert_eq!(controller.metrics().ticks_dropped, 0);
    }

    #[test]
    fn stream_mode_drops_ticks_while_socket_is_backed_up() {
        let t0 = Instant::now();
        let (mut controller, wire) = streaming(TransportMode::Stream, "stub://camera", t0);
        controller.on_tick(t0);

        wire.borrow_mut().in_flight = true;
        controller.on_tick(t0 + Duration::from_millis(100));
        controller.on_tick(t0 + Duration::from_millis(200));
        assert_eq!(wire.borrow().sent.len(), 1);
        assert_eq!(controller.metrics().ticks_dropped, 2);

        wire.borrow_mut().in_flight = false;
        controller.on_tick(t0 + Duration::from_millis(300));
        assert_eq!(wire.borrow().sent.len(), 2);
        assert_eq!(controller.state(), ConnectionState::Streaming);
    }

    #[test]
    fn refused_stream_write_keeps_session_streaming() {
        let t0 = Instant::now();
        let (mut controller, wire) = streaming(TransportMode::Stream, "stub://camera", t0);
        wire.borrow_mut().fail_send =
            Some(TransportError::SendFailed("stream write buffer full".to_string()));

        controller.on_tick(t0);
        assert_eq!(controller.state(), ConnectionState::Streaming);
        assert!(controller.source().is_open());
        assert!(wire.borrow().sent.is_empty());
        assert_eq!(wire.borrow().close_calls, 0);
        assert_eq!(
            controller.metrics().last_error.as_deref(),
            Some("stream write buffer full")
        );

        controller.on_tick(t0 + Duration::from_millis(100));
        assert_eq!(wire.borrow().sent.len(), 1);
    }

    #[test]
    fn warmup_surfaces_skip_ticks() {
        let t0 = Instant::now();
        let (mut controller, wire) = streaming(TransportMode::Stream, "stub://camera?warmup=2", t0);
        for i in 0..3u64 {
            controller.on_tick(t0 + Duration::from_millis(i * 100));
        }
        assert_eq!(wire.borrow().sent.len(), 1);
        assert_eq!(controller.metrics().ticks_skipped, 2);
        assert_eq!(controller.state(), ConnectionState::Streaming);
    }

    #[test]
    fn user_stop_releases_source_and_halts_ticks() {
        let t0 = Instant::now();
        let (mut controller, wire) = streaming(TransportMode::Stream, "stub://camera", t0);
        controller.on_tick(t0);

        controller.stop();
        assert_eq!(controller.state(), ConnectionState::Connected);
        assert!(!controller.source().is_open());
        assert_eq!(controller.next_deadline(), None);
        assert_eq!(wire.borrow().controls, vec![OutboundMessage::StopStream]);

        controller.on_tick(t0 + Duration::from_secs(1));
        assert_eq!(wire.borrow().sent.len(), 1);
    }

    #[test]
    fn request_mode_stop_disconnects() {
        let t0 = Instant::now();
        let (mut controller, wire) = streaming(TransportMode::Request, "stub://camera", t0);
        controller.stop();
        assert_eq!(controller.state(), ConnectionState::Disconnected);
        assert!(!controller.source().is_open());
        assert!(!wire.borrow().open);
        assert!(wire.borrow().controls.is_empty());
    }

    #[test]
    fn device_loss_releases_source() {
        let t0 = Instant::now();
        let (mut controller, wire) =
            streaming(TransportMode::Stream, "stub://camera?lose_after=1", t0);
        controller.on_tick(t0);
        controller.on_tick(t0 + Duration::from_millis(100));

        assert_eq!(controller.state(), ConnectionState::Connected);
        assert!(!controller.source().is_open());
        assert_eq!(controller.next_deadline(), None);
        assert_eq!(wire.borrow().sent.len(), 1);
        assert!(controller.metrics().last_error.is_some());
    }

    #[test]
    fn camera_failure_keeps_session_connected() {
        let t0 = Instant::now();
        let (mut controller, _wire) = controller(TransportMode::Stream, "stub://denied");
        controller.start(t0);
        controller.handle_transport_event(TransportEvent::Opened, t0);

        assert_eq!(controller.state(), ConnectionState::Connected);
        assert!(!controller.source().is_open());
        assert!(controller
            .metrics()
            .last_error
            .as_deref()
            .is_some_and(|msg| msg.contains("permission denied")));
    }

    #[test]
    fn connection_loss_enters_erroring_then_reconnects_after_backoff() {
        let t0 = Instant::now();
        let (mut controller, wire) = streaming(TransportMode::Stream, "stub://camera", t0);
        controller.on_tick(t0);

        controller.handle_transport_event(
            TransportEvent::Failed(TransportError::ConnectionLost("reset".to_string())),
            t0,
        );
        assert_eq!(controller.state(), ConnectionState::Erroring);
        assert!(!controller.source().is_open());
        assert_eq!(
            controller.next_deadline(),
            Some(t0 + Duration::from_millis(500))
        );

        controller.poll_retry(t0 + Duration::from_millis(499));
        assert_eq!(controller.state(), ConnectionState::Erroring);

        controller.poll_retry(t0 + Duration::from_millis(500));
        assert_eq!(controller.state(), ConnectionState::Connecting);
        assert_eq!(wire.borrow().open_calls, 2);
        assert_eq!(controller.metrics().reconnect_attempts, 1);

        controller.handle_transport_event(TransportEvent::Opened, t0 + Duration::from_secs(1));
        assert_eq!(controller.state(), ConnectionState::Streaming);
    }

    #[test]
    fn stop_during_backoff_prevents_reconnect() {
        let t0 = Instant::now();
        let (mut controller, wire) = streaming(TransportMode::Stream, "stub://camera", t0);
        controller.handle_transport_event(TransportEvent::Closed, t0);
        assert_eq!(controller.state(), ConnectionState::Erroring);

        controller.stop();
        assert_eq!(controller.state(), ConnectionState::Disconnected);

        controller.poll_retry(t0 + Duration::from_secs(10));
        assert_eq!(controller.state(), ConnectionState::Disconnected);
        assert_eq!(wire.borrow().open_calls, 1);
    }

    #[test]
    fn bounded_policy_gives_up() {
        let t0 = Instant::now();
        let (transport, wire) = FakeTransport::new(TransportMode::Stream);
        let config = SessionConfig {
            reconnect: ReconnectPolicy::bounded(Duration::from_millis(100), 1),
            ..SessionConfig::default()
        };
        let mut controller =
            SessionController::new(config, transport, SyntheticSource::new("stub://camera"))
                .expect("controller");
        let lost = || TransportEvent::Failed(TransportError::ConnectFailed("refused".to_string()));

        controller.start(t0);
        controller.handle_transport_event(lost(), t0);
        assert_eq!(controller.state(), ConnectionState::Erroring);

        controller.poll_retry(t0 + Duration::from_millis(100));
        assert_eq!(controller.state(), ConnectionState::Connecting);
        controller.handle_transport_event(lost(), t0 + Duration::from_millis(150));
        assert_eq!(controller.state(), ConnectionState::Disconnected);
        assert_eq!(wire.borrow().open_calls, 2);
    }

    #[test]
    fn results_after_close_are_discarded() {
        let t0 = Instant::now();
        let (mut controller, _wire) = streaming(TransportMode::Stream, "stub://camera", t0);
        controller.close();
        assert_eq!(controller.state(), ConnectionState::Idle);
        assert!(!controller.source().is_open());

        let before = controller.snapshot();
        controller.handle_transport_event(
            TransportEvent::Message(InboundMessage::Detection(result(
                ClassCounts::new(1, 1),
                ClassCounts::new(5, 5),
            ))),
            t0,
        );
        controller.handle_transport_event(TransportEvent::Opened, t0);
        assert_eq!(controller.snapshot(), before);
    }

    #[test]
    fn statistics_are_replaced_not_summed() {
        let t0 = Instant::now();
        let (mut controller, _wire) = streaming(TransportMode::Stream, "stub://camera", t0);
        for (current, cumulative) in [
            (ClassCounts::new(2, 1), ClassCounts::new(10, 20)),
            (ClassCounts::new(0, 1), ClassCounts::new(3, 4)),
        ] {
            controller.handle_transport_event(
                TransportEvent::Message(InboundMessage::Detection(result(current, cumulative))),
                t0,
            );
        }
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.current_counts, ClassCounts::new(0, 1));
        assert_eq!(snapshot.cumulative_statistics, ClassCounts::new(3, 4));
        assert!(snapshot.annotated_image.is_some());
        assert_eq!(snapshot.metrics.results_received, 2);
    }

    #[test]
    fn annotated_image_survives_result_without_one() {
        let t0 = Instant::now();
        let (mut controller, _wire) = streaming(TransportMode::Stream, "stub://camera", t0);
        let first = result(ClassCounts::ZERO, ClassCounts::ZERO);
        let second = DetectionResult {
            annotated_image: None,
            ..first.clone()
        };
        for detection in [first, second] {
            controller.handle_transport_event(
                TransportEvent::Message(InboundMessage::Detection(detection)),
                t0,
            );
        }
        assert_eq!(
            controller.snapshot().annotated_image.as_deref(),
            Some(&[0xFFu8, 0xD8][..])
        );
    }

    #[test]
    fn malformed_message_changes_nothing() {
        let t0 = Instant::now();
        let (mut controller, _wire) = streaming(TransportMode::Stream, "stub://camera", t0);
        let before = controller.snapshot();

        controller.handle_transport_event(
            TransportEvent::Failed(TransportError::MalformedMessage("eof".to_string())),
            t0,
        );
        let after = controller.snapshot();
        assert_eq!(after.state, ConnectionState::Streaming);
        assert_eq!(after.detection, before.detection);
        assert_eq!(after.cumulative_statistics, before.cumulative_statistics);
        assert_eq!(after.metrics.malformed_messages, 1);
    }

    #[test]
    fn remote_error_is_surfaced_without_disconnecting() {
        let t0 = Instant::now();
        let (mut controller, _wire) = streaming(TransportMode::Stream, "stub://camera", t0);
        controller.handle_transport_event(
            TransportEvent::Message(InboundMessage::Error("Detection model not loaded".to_string())),
            t0,
        );
        assert_eq!(controller.state(), ConnectionState::Streaming);
        assert_eq!(
            controller.metrics().last_error.as_deref(),
            Some("Detection model not loaded")
        );
    }

    #[test]
    fn request_failure_is_reported_per_call() {
        let t0 = Instant::now();
        let (mut controller, _wire) = streaming(TransportMode::Request, "stub://camera", t0);
        controller.handle_transport_event(
            TransportEvent::Response(Err(TransportError::SendFailed("timeout".to_string()))),
            t0,
        );
        assert_eq!(controller.state(), ConnectionState::Streaming);
        assert!(controller.source().is_open());
        assert!(controller.metrics().last_error.is_some());
    }

    #[test]
    fn reset_zeroes_counts_immediately() {
        let t0 = Instant::now();
        let (mut controller, _wire) = streaming(TransportMode::Stream, "stub://camera", t0);
        controller.handle_transport_event(
            TransportEvent::Message(InboundMessage::Detection(result(
                ClassCounts::new(2, 3),
                ClassCounts::new(40, 50),
            ))),
            t0,
        );

        controller.on_statistics_reset(Ok(()));
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.current_counts, ClassCounts::ZERO);
        assert_eq!(snapshot.cumulative_statistics, ClassCounts::ZERO);

        controller.on_statistics_reset(Err(TransportError::ConnectFailed("down".to_string())));
        assert!(controller.metrics().last_error.is_some());
        assert_eq!(controller.snapshot().cumulative_statistics, ClassCounts::ZERO);
    }

    #[test]
    fn observers_see_every_transition() {
        let t0 = Instant::now();
        let (mut controller, _wire) = controller(TransportMode::Stream, "stub://camera");
        let updates = controller.subscribe();

        controller.start(t0);
        controller.handle_transport_event(TransportEvent::Opened, t0);

        let states: Vec<ConnectionState> = updates.try_iter().map(|s| s.state).collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Idle,
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Streaming,
            ]
        );

        drop(updates);
        controller.stop();
        assert!(controller.observers.is_empty());
    }
}
