//! Out-of-band calls to the detection service's HTTP API.
//!
//! These run alongside the capture session and never touch the transport:
//! - `POST /api/reset_statistics` zeroes the service's cumulative counters
//! - `GET /health` reports model and connection health (`GET /api/status`
//!   on older service revisions)
//! - `GET /api` returns the service banner

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::transport::TransportError;

const HEALTH_PATH: &str = "/health";
const LEGACY_STATUS_PATH: &str = "/api/status";

/// Health report from `GET /health`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub model_loaded: bool,
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub active_connections: Option<u64>,
    /// Seconds since the Unix epoch, as reported by the service.
    #[serde(default)]
    pub timestamp: Option<f64>,
}

impl ServiceStatus {
    pub fn is_healthy(&self) -> bool {
        self.status.eq_ignore_ascii_case("healthy") && self.model_loaded
    }
}

/// Banner from `GET /api`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceBanner {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub model_loaded: bool,
}

/// Side channel used to reset statistics and query service health.
pub trait StatisticsAdmin {
    fn reset_statistics(&self) -> Result<(), TransportError>;
    fn status(&self) -> Result<ServiceStatus, TransportError>;
}

#[derive(Deserialize)]
struct ResetReply {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    message: Option<String>,
}

/// `StatisticsAdmin` backed by the service's HTTP API.
#[derive(Clone)]
pub struct HttpAdmin {
    base: String,
    agent: ureq::Agent,
}

impl HttpAdmin {
    /// `base` is the API root, e.g. "http://127.0.0.1:5000".
    pub fn new(base: &str, timeout: Duration) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn banner(&self) -> Result<ServiceBanner, TransportError> {
        let body = self.call(self.agent.get(&self.url("/api")), None)?;
        serde_json::from_str(&body).map_err(|e| TransportError::MalformedMessage(e.to_string()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn call(&self, request: ureq::Request, body: Option<&str>) -> Result<String, TransportError> {
        self.fetch(request, body).map_err(TransportError::from)
    }

    fn fetch(&self, request: ureq::Request, body: Option<&str>) -> Result<String, CallFailure> {
        let result = match body {
            Some(body) => request
                .set("Content-Type", "application/json")
                .send_string(body),
            None => request.call(),
        };
        match result {
            Ok(response) => response.into_string().map_err(|e| {
                CallFailure::Failed(TransportError::ConnectionLost(format!(
                    "read response: {}",
                    e
                )))
            }),
            Err(ureq::Error::Status(code, response)) => {
                let text = response.into_string().unwrap_or_default();
                Err(CallFailure::Status(code, remote_message(code, &text)))
            }
            Err(ureq::Error::Transport(err)) => Err(CallFailure::Failed(
                TransportError::ConnectFailed(format!("{}: {}", self.base, err)),
            )),
        }
    }
}

impl StatisticsAdmin for HttpAdmin {
    fn reset_statistics(&self) -> Result<(), TransportError> {
        let body = self.call(
            self.agent.post(&self.url("/api/reset_statistics")),
            Some("{}"),
        )?;
        if body.trim().is_empty() {
            return Ok(());
        }
        let reply: ResetReply = serde_json::from_str(&body)
            .map_err(|e| TransportError::MalformedMessage(e.to_string()))?;
        match reply.success {
            Some(false) => Err(TransportError::RemoteError(
                reply
                    .message
                    .unwrap_or_else(|| "statistics reset rejected".to_string()),
            )),
            _ => {
                log::info!(
                    "HttpAdmin: {}",
                    reply.message.as_deref().unwrap_or("statistics reset")
                );
                Ok(())
            }
        }
    }

    fn status(&self) -> Result<ServiceStatus, TransportError> {
        let body = match self.fetch(self.agent.get(&self.url(HEALTH_PATH)), None) {
            Err(CallFailure::Status(404, _)) => {
                log::debug!(
                    "HttpAdmin: {} not served, trying {}",
                    HEALTH_PATH,
                    LEGACY_STATUS_PATH
                );
                self.call(self.agent.get(&self.url(LEGACY_STATUS_PATH)), None)?
            }
            other => other?,
        };
        serde_json::from_str(&body).map_err(|e| TransportError::MalformedMessage(e.to_string()))
    }
}

enum CallFailure {
    /// The service answered with a non-success status.
    Status(u16, String),
    Failed(TransportError),
}

impl From<CallFailure> for TransportError {
    fn from(failure: CallFailure) -> Self {
        match failure {
            CallFailure::Status(_, message) => TransportError::RemoteError(message),
            CallFailure::Failed(err) => err,
        }
    }
}

/// Pull the human-readable message out of an error body, falling back to
/// the status line.
fn remote_message(code: u16, body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        #[serde(alias = "detail", alias = "error")]
        message: String,
    }
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed.message,
        Err(_) if body.trim().is_empty() => format!("HTTP {}", code),
        Err(_) => format!("HTTP {}: {}", code, body.trim()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_service_payload() {
        let status: ServiceStatus = serde_json::from_str(
            r#"{"status": "healthy", "model_loaded": true, "model_type": "YOLOv8",
                "active_connections": 2, "timestamp": 1718000000.5}"#,
        )
        .expect("status");
        assert!(status.is_healthy());
        assert_eq!(status.model_type.as_deref(), Some("YOLOv8"));
        assert_eq!(status.active_connections, Some(2));

        let degraded: ServiceStatus =
            serde_json::from_str(r#"{"status": "healthy", "model_loaded": false}"#)
                .expect("status");
        assert!(!degraded.is_healthy());
    }

    #[test]
    fn remote_message_prefers_body_text() {
        assert_eq!(
            remote_message(500, r#"{"detail": "Detection model not loaded"}"#),
            "Detection model not loaded"
        );
        assert_eq!(remote_message(503, ""), "HTTP 503");
        assert_eq!(remote_message(502, "bad gateway"), "HTTP 502: bad gateway");
    }

    #[test]
    fn base_url_drops_trailing_slash() {
        let admin = HttpAdmin::new("http://127.0.0.1:5000/", Duration::from_secs(1));
        assert_eq!(admin.base(), "http://127.0.0.1:5000");
        assert_eq!(admin.url("/api/status"), "http://127.0.0.1:5000/api/status");
    }

    #[test]
    fn unreachable_service_is_a_connect_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        let admin = HttpAdmin::new(&format!("http://127.0.0.1:{}", port), Duration::from_secs(1));
        assert!(matches!(
            admin.reset_statistics(),
            Err(TransportError::ConnectFailed(_))
        ));
    }
}
