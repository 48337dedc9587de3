use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::admin::ServiceStatus;
use crate::detection::{ClassCounts, DetectionResult};
use crate::metrics::SessionMetrics;

/// Lifecycle of one client session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Streaming,
    Erroring,
    Disconnected,
}

impl ConnectionState {
    /// States in which frames may be produced.
    pub fn is_live(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Streaming)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Erroring => "erroring",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Everything an observer may read about a session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    /// Latest result applied to the session.
    pub detection: Option<DetectionResult>,
    pub current_counts: ClassCounts,
    pub cumulative_statistics: ClassCounts,
    /// Most recent annotated image; kept when a later result carries none.
    pub annotated_image: Option<Arc<[u8]>>,
    pub metrics: SessionMetrics,
    pub service: Option<ServiceStatus>,
}
