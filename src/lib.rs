//! Sentinel capture client
//!
//! This crate turns a live camera into a bounded stream of JPEG frames,
//! delivers them to a remote safety-vest detection service and republishes
//! the results (detection, annotated image, statistics) to observers.
//!
//! # Architecture
//!
//! The pipeline is built leaf-first:
//!
//! 1. **FrameSource**: owns the camera device between `open` and `close`.
//! 2. **FrameEncoder**: rasterizes the live surface into a still JPEG.
//! 3. **Transport**: a persistent WebSocket stream or one HTTP request per frame.
//! 4. **CaptureScheduler**: fixed-rate ticks with at-most-one request in flight.
//! 5. **SessionController**: the connection lifecycle state machine.
//!
//! `ClientRuntime` drives one controller on a single thread; blocking
//! network calls run on helper threads and report back over channels.
//!
//! # Module Structure
//!
//! - `frame`: `PixelSurface`, `Frame`, `FrameEncoder`
//! - `ingest`: frame sources (synthetic `stub://`, V4L2)
//! - `transport`: wire protocol, `StreamTransport`, `RequestTransport`
//! - `admin`: statistics reset and service status side channel
//! - `session`: `SessionController`, `ConnectionState`, `ReconnectPolicy`
//! - `runtime`: command-driven driver loop
//! - `config`: layered file/env configuration

pub mod admin;
pub mod config;
pub mod detection;
pub mod frame;
pub mod ingest;
pub mod metrics;
pub mod runtime;
pub mod scheduler;
pub mod session;
pub mod transport;

pub use admin::{HttpAdmin, ServiceBanner, ServiceStatus, StatisticsAdmin};
pub use config::ClientConfig;
pub use detection::{ClassCounts, DetectionResult, Verdict};
pub use frame::{Frame, FrameEncoder, PixelFormat, PixelSurface};
pub use ingest::{open_source, AcquisitionError, CaptureConstraints, FrameSource, SyntheticSource};
#[cfg(feature = "ingest-v4l2")]
pub use ingest::V4l2Source;
pub use metrics::SessionMetrics;
pub use runtime::{ClientRuntime, Command};
pub use scheduler::{CaptureScheduler, TickDecision};
pub use session::{
    ConnectionState, ReconnectPolicy, SessionConfig, SessionController, SessionSnapshot,
};
pub use transport::request::RequestConfig;
pub use transport::stream::StreamConfig;
pub use transport::{
    RequestTransport, StreamTransport, Transport, TransportError, TransportEvent, TransportMode,
};

/// Build the transport selected by `config`.
pub fn build_transport(config: &ClientConfig) -> Box<dyn Transport + Send> {
    match config.transport {
        TransportMode::Stream => Box::new(StreamTransport::new(config.stream_config())),
        TransportMode::Request => Box::new(RequestTransport::new(config.request_config())),
    }
}
