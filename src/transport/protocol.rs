//! JSON message schema shared by both transports.
//!
//! Outbound: `{"action": "process_frame", "frame_data": <base64 jpeg>, "timestamp": <ms>}`
//! and `{"action": "stop_stream"}`.
//!
//! Inbound: `{"type": "detection_result", "detection": {...}, "annotated_frame": <base64>}`,
//! `{"type": "error", "message": ...}` or `{"type": "info", "message": ...}`.
//! Unknown `type` values parse to `InboundMessage::Unknown` instead of failing.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::TransportError;
use crate::detection::{ClassCounts, DetectionResult};
use crate::frame::Frame;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OutboundMessage {
    ProcessFrame { frame_data: String, timestamp: u64 },
    StopStream,
}

impl OutboundMessage {
    pub fn process_frame(frame: &Frame) -> Self {
        OutboundMessage::ProcessFrame {
            frame_data: STANDARD.encode(frame.payload()),
            timestamp: frame.captured_at_ms,
        }
    }
}

pub fn encode_outbound(message: &OutboundMessage) -> Result<String, TransportError> {
    serde_json::to_string(message).map_err(|e| TransportError::SendFailed(e.to_string()))
}

#[derive(Clone, Debug, PartialEq)]
pub enum InboundMessage {
    Detection(DetectionResult),
    Error(String),
    Info(String),
    /// A `type` this client does not understand.
    Unknown(String),
}

#[derive(Debug, Deserialize)]
struct DetectionEnvelope {
    detection: WireDetection,
    #[serde(default)]
    annotated_frame: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireDetection {
    #[serde(default)]
    detected: bool,
    #[serde(default)]
    class_name: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    counts: ClassCounts,
    #[serde(default)]
    statistics: ClassCounts,
    /// Older service revisions embed the image inside the detection object.
    #[serde(default)]
    annotated_frame: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TextEnvelope {
    #[serde(default)]
    message: String,
}

/// Parse one message pushed by the service.
pub fn parse_inbound(payload: &[u8]) -> Result<InboundMessage, TransportError> {
    let value: Value = serde_json::from_slice(payload).map_err(malformed)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| TransportError::MalformedMessage("missing 'type' field".to_string()))?
        .to_string();

    match kind.as_str() {
        "detection_result" => {
            let envelope: DetectionEnvelope = serde_json::from_value(value).map_err(malformed)?;
            let image = envelope.annotated_frame;
            Ok(InboundMessage::Detection(envelope.detection.into_result(image)?))
        }
        "error" => {
            let text: TextEnvelope = serde_json::from_value(value).map_err(malformed)?;
            Ok(InboundMessage::Error(text.message))
        }
        "info" => {
            let text: TextEnvelope = serde_json::from_value(value).map_err(malformed)?;
            Ok(InboundMessage::Info(text.message))
        }
        _ => Ok(InboundMessage::Unknown(kind)),
    }
}

/// Parse the body of a request-style call into exactly one result or error.
///
/// Accepts the tagged envelope used on the stream as well as a bare detection
/// object.
pub fn parse_response(body: &[u8]) -> Result<DetectionResult, TransportError> {
    let value: Value = serde_json::from_slice(body).map_err(malformed)?;
    if value.get("type").is_none() {
        let detection: WireDetection = serde_json::from_value(value).map_err(malformed)?;
        return detection.into_result(None);
    }
    match parse_inbound(body)? {
        InboundMessage::Detection(result) => Ok(result),
        InboundMessage::Error(message) => Err(TransportError::RemoteError(message)),
        InboundMessage::Info(message) => Err(TransportError::MalformedMessage(format!(
            "expected a detection result, got info: {}",
            message
        ))),
        InboundMessage::Unknown(kind) => Err(TransportError::MalformedMessage(format!(
            "expected a detection result, got type '{}'",
            kind
        ))),
    }
}

impl WireDetection {
    fn into_result(self, envelope_image: Option<String>) -> Result<DetectionResult, TransportError> {
        let annotated_image = match envelope_image.or(self.annotated_frame) {
            Some(encoded) if !encoded.is_empty() => Some(decode_image(&encoded)?.into()),
            _ => None,
        };
        let confidence = if self.confidence.is_finite() {
            self.confidence.clamp(0.0, 1.0) as f32
        } else {
            0.0
        };
        Ok(DetectionResult {
            detected: self.detected,
            class_label: self.class_name,
            confidence,
            current_counts: self.counts,
            cumulative_statistics: self.statistics,
            annotated_image,
        })
    }
}

/// Decode a base64 image, tolerating a `data:` URL prefix.
fn decode_image(encoded: &str) -> Result<Vec<u8>, TransportError> {
    let data = match encoded.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => encoded,
    };
    STANDARD
        .decode(data.trim())
        .map_err(|e| TransportError::MalformedMessage(format!("annotated frame: {}", e)))
}

fn malformed(err: serde_json::Error) -> TransportError {
    TransportError::MalformedMessage(err.to_string())
}
