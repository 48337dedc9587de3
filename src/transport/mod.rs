//! Transport layer between the capture session and the detection service.
//!
//! Two interchangeable transports carry the same message contract:
//! - `StreamTransport`: one long-lived WebSocket; fire-and-forget sends and an
//!   unordered stream of results delivered in arrival order.
//! - `RequestTransport`: one HTTP call per frame, resolving to exactly one
//!   result or one error. No persistent connection.
//!
//! Transports never block the session driver for longer than the timeout it
//! passes to `poll`, and they never reconnect on their own. Reconnection policy
//! belongs to the session controller.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::detection::DetectionResult;
use crate::frame::Frame;

pub mod protocol;
pub mod request;
pub mod stream;

pub use protocol::{encode_outbound, parse_inbound, parse_response, InboundMessage, OutboundMessage};
pub use request::RequestTransport;
pub use stream::StreamTransport;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    #[default]
    Stream,
    Request,
}

impl FromStr for TransportMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "stream" | "ws" | "websocket" => Ok(TransportMode::Stream),
            "request" | "http" => Ok(TransportMode::Request),
            other => Err(anyhow::anyhow!(
                "unknown transport mode '{}'; expected 'stream' or 'request'",
                other
            )),
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Stream => f.write_str("stream"),
            TransportMode::Request => f.write_str("request"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    /// Business-level failure reported by the service in a well-formed message.
    #[error("remote error: {0}")]
    RemoteError(String),

    /// A single payload that could not be parsed. Recovered locally.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

/// Something a transport observed since the last poll.
#[derive(Debug)]
pub enum TransportEvent {
    /// `open()` completed; the transport is sendable.
    Opened,
    /// Message pushed by the service over a persistent connection.
    Message(InboundMessage),
    /// Outcome of the single outstanding request.
    Response(Result<DetectionResult, TransportError>),
    /// Connect failure, connection loss or an unparseable payload.
    Failed(TransportError),
    /// The remote end closed the connection cleanly.
    Closed,
}

/// A channel to the detection service.
pub trait Transport {
    fn mode(&self) -> TransportMode;

    /// URL this transport delivers frames to.
    fn endpoint(&self) -> &str;

    /// Begin opening the channel. Completion is reported as `TransportEvent::Opened`.
    fn open(&mut self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    /// True while an earlier send is still outstanding: an unresolved request,
    /// or stream bytes the socket has not taken yet. Capture ticks are dropped
    /// while this holds.
    fn in_flight(&self) -> bool {
        false
    }

    /// Hand a frame to the transport. The frame is consumed either way.
    fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Send a control message that carries no frame.
    fn send_control(&mut self, message: &OutboundMessage) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next event.
    fn poll(&mut self, timeout: Duration) -> Option<TransportEvent>;

    /// Tear the channel down. Idempotent. Results of calls made before
    /// `close` are never reported afterwards.
    fn close(&mut self);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn mode(&self) -> TransportMode {
        (**self).mode()
    }

    fn endpoint(&self) -> &str {
        (**self).endpoint()
    }

    fn open(&mut self) -> Result<(), TransportError> {
        (**self).open()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn in_flight(&self) -> bool {
        (**self).in_flight()
    }

    fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        (**self).send(frame)
    }

    fn send_control(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        (**self).send_control(message)
    }

    fn poll(&mut self, timeout: Duration) -> Option<TransportEvent> {
        (**self).poll(timeout)
    }

    fn close(&mut self) {
        (**self).close()
    }
}
