//! Request/response transport: one HTTP POST per frame.
//!
//! At most one call is outstanding. Each call runs on its own worker thread
//! and reports back over a channel tagged with the generation it was issued
//! in; `close` bumps the generation so a call that resolves afterwards is
//! silently dropped instead of leaking into a later session.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use super::protocol::{encode_outbound, parse_response, OutboundMessage};
use super::{Transport, TransportError, TransportEvent, TransportMode};
use crate::detection::DetectionResult;
use crate::frame::Frame;

type CallResult = Result<DetectionResult, TransportError>;

/// Configuration for a request transport.
#[derive(Clone, Debug)]
pub struct RequestConfig {
    /// Full URL frames are posted to (e.g. "http://127.0.0.1:5000/api/process_frame").
    pub endpoint: String,
    pub timeout: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:5000/api/process_frame".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

pub struct RequestTransport {
    config: RequestConfig,
    agent: ureq::Agent,
    open: bool,
    pending_opened: bool,
    generation: u64,
    in_flight: Option<u64>,
    tx: Sender<(u64, CallResult)>,
    rx: Receiver<(u64, CallResult)>,
    calls_issued: u64,
}

impl RequestTransport {
    pub fn new(config: RequestConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        let (tx, rx) = mpsc::channel();
        Self {
            config,
            agent,
            open: false,
            pending_opened: false,
            generation: 0,
            in_flight: None,
            tx,
            rx,
            calls_issued: 0,
        }
    }

    pub fn calls_issued(&self) -> u64 {
        self.calls_issued
    }
}

impl Transport for RequestTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Request
    }

    fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    fn open(&mut self) -> Result<(), TransportError> {
        self.generation += 1;
        self.in_flight = None;
        self.open = true;
        self.pending_opened = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::SendFailed(
                "request transport is not open".to_string(),
            ));
        }
        if self.in_flight.is_some() {
            return Err(TransportError::SendFailed(
                "a request is already in flight".to_string(),
            ));
        }

        let body = encode_outbound(&OutboundMessage::process_frame(&frame))?;
        drop(frame);

        let generation = self.generation;
        let agent = self.agent.clone();
        let endpoint = self.config.endpoint.clone();
        let tx = self.tx.clone();
        std::thread::Builder::new()
            .name("sentinel-http-call".to_string())
            .spawn(move || {
                let _ = tx.send((generation, post_frame(&agent, &endpoint, &body)));
            })
            .map_err(|e| TransportError::SendFailed(format!("spawn request worker: {}", e)))?;

        self.in_flight = Some(generation);
        self.calls_issued += 1;
        Ok(())
    }

    /// Request mode has no side channel for control messages.
    fn send_control(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        log::debug!("RequestTransport: ignoring control message {:?}", message);
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Option<TransportEvent> {
        if self.pending_opened {
            self.pending_opened = false;
            return Some(TransportEvent::Opened);
        }
        if self.in_flight.is_none() {
            // Nothing outstanding; still drain stale results left by a close.
            while self.rx.try_recv().is_ok() {}
            std::thread::sleep(timeout);
            return None;
        }

        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok((generation, result)) if Some(generation) == self.in_flight => {
                    self.in_flight = None;
                    return Some(TransportEvent::Response(result));
                }
                Ok((generation, _)) => {
                    log::debug!(
                        "RequestTransport: discarding result from closed generation {}",
                        generation
                    );
                }
                Err(RecvTimeoutError::Timeout) => return None,
                // `self.tx` keeps the channel alive.
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn close(&mut self) {
        if self.open {
            log::info!("RequestTransport: closed {}", self.config.endpoint);
        }
        self.open = false;
        self.pending_opened = false;
        self.in_flight = None;
        self.generation += 1;
    }
}

fn post_frame(agent: &ureq::Agent, endpoint: &str, body: &str) -> CallResult {
    let response = match agent
        .post(endpoint)
        .set("Content-Type", "application/json")
        .send_string(body)
    {
        Ok(response) => response,
        Err(ureq::Error::Status(code, response)) => {
            let text = response.into_string().unwrap_or_default();
            // The service reports failures as `{"type": "error", "message": ...}`.
            let message = match parse_response(text.as_bytes()) {
                Err(TransportError::RemoteError(message)) => message,
                _ => format!("HTTP {}: {}", code, text.trim()),
            };
            return Err(TransportError::RemoteError(message));
        }
        Err(ureq::Error::Transport(err)) => {
            return Err(TransportError::SendFailed(format!("{}: {}", endpoint, err)));
        }
    };

    let text = response
        .into_string()
        .map_err(|e| TransportError::ConnectionLost(format!("read response: {}", e)))?;
    parse_response(text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameEncoder, PixelFormat, PixelSurface};

    fn frame() -> Frame {
        let pixels = vec![128u8; 8 * 8 * 3];
        let surface = PixelSurface::new(&pixels, 8, 8, PixelFormat::Rgb8);
        FrameEncoder::new(0.7)
            .expect("encoder")
            .encode(&surface)
            .expect("frame")
    }

    fn unreachable_config() -> RequestConfig {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        RequestConfig {
            endpoint: format!("http://127.0.0.1:{}/api/process_frame", port),
            timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn send_requires_open() {
        let mut transport = RequestTransport::new(RequestConfig::default());
        assert_eq!(
            transport.endpoint(),
            "http://127.0.0.1:5000/api/process_frame"
        );
        assert!(matches!(
            transport.send(frame()),
            Err(TransportError::SendFailed(_))
        ));
        assert_eq!(transport.calls_issued(), 0);
    }

    #[test]
    fn open_is_reported_once() {
        let mut transport = RequestTransport::new(RequestConfig::default());
        transport.open().expect("open");
        assert!(matches!(
            transport.poll(Duration::from_millis(1)),
            Some(TransportEvent::Opened)
        ));
        assert!(transport.poll(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn second_send_is_rejected_while_in_flight() {
        let mut transport = RequestTransport::new(unreachable_config());
        transport.open().expect("open");
        transport.send(frame()).expect("first send");
        assert!(transport.in_flight());
        assert!(matches!(
            transport.send(frame()),
            Err(TransportError::SendFailed(_))
        ));
        assert_eq!(transport.calls_issued(), 1);
    }

    #[test]
    fn failed_call_resolves_once_and_clears_in_flight() {
        let mut transport = RequestTransport::new(unreachable_config());
        transport.open().expect("open");
        let _ = transport.poll(Duration::from_millis(1));
        transport.send(frame()).expect("send");

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut event = None;
        while event.is_none() && std::time::Instant::now() < deadline {
            event = transport.poll(Duration::from_millis(50));
        }
        assert!(matches!(
            event,
            Some(TransportEvent::Response(Err(TransportError::SendFailed(_))))
        ));
        assert!(!transport.in_flight());
    }

    #[test]
    fn results_after_close_are_discarded() {
        let mut transport = RequestTransport::new(unreachable_config());
        transport.open().expect("open");
        let _ = transport.poll(Duration::from_millis(1));
        transport.send(frame()).expect("send");
        transport.close();
        assert!(!transport.in_flight());

        transport.open().expect("reopen");
        assert!(matches!(
            transport.poll(Duration::from_millis(1)),
            Some(TransportEvent::Opened)
        ));
        // The stale failure from the first generation never surfaces.
        let deadline = std::time::Instant::now() + Duration::from_millis(500);
        while std::time::Instant::now() < deadline {
            assert!(transport.poll(Duration::from_millis(50)).is_none());
        }
    }
}
