//! Camera frame sources.
//!
//! This module provides the sources a capture session can own:
//! - Synthetic `stub://` source (tests, demos, failure simulation)
//! - USB/V4L2 devices (feature: ingest-v4l2)
//!
//! A source is a scoped resource. It holds the device only between `open` and
//! `close`, and `close` must be safe to call at any time, any number of times.
//! The session controller calls it on every path that leaves streaming.

use thiserror::Error;

use crate::frame::PixelSurface;

pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// Requested capture parameters. Devices treat these as hints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub ideal_frame_rate: u32,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 640,
            ideal_height: 480,
            ideal_frame_rate: 30,
        }
    }
}

/// Device-level acquisition failures.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AcquisitionError {
    #[error("permission denied for camera {0}")]
    PermissionDenied(String),

    #[error("camera {0} not found")]
    DeviceNotFound(String),

    #[error("camera {device} unsupported: {reason}")]
    DeviceUnsupported { device: String, reason: String },

    #[error("camera {0} lost")]
    DeviceLost(String),

    #[error("camera error: {0}")]
    Unknown(String),
}

impl AcquisitionError {
    /// Classify an OS error raised while opening `device`.
    pub fn from_io(device: &str, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(device.to_string()),
            std::io::ErrorKind::NotFound => Self::DeviceNotFound(device.to_string()),
            _ => Self::Unknown(format!("{}: {}", device, err)),
        }
    }
}

/// A live camera.
pub trait FrameSource {
    /// Device identifier (path or `stub://` URL).
    fn name(&self) -> &str;

    /// Acquire the device. Opening an already open source is a no-op.
    fn open(&mut self, constraints: &CaptureConstraints) -> Result<(), AcquisitionError>;

    /// Current pixel surface. Zero-area while the device warms up.
    fn surface(&mut self) -> Result<PixelSurface<'_>, AcquisitionError>;

    /// Dimensions the device actually delivers, once open.
    fn dimensions(&self) -> Option<(u32, u32)>;

    fn is_open(&self) -> bool;

    /// Release every device resource. Idempotent.
    fn close(&mut self);
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn open(&mut self, constraints: &CaptureConstraints) -> Result<(), AcquisitionError> {
        (**self).open(constraints)
    }

    fn surface(&mut self) -> Result<PixelSurface<'_>, AcquisitionError> {
        (**self).surface()
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        (**self).dimensions()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Select a source implementation for `device`.
///
/// `stub://` URLs map to the synthetic source; anything else is a device node.
pub fn open_source(device: &str) -> anyhow::Result<Box<dyn FrameSource>> {
    if device.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(device)));
    }
    #[cfg(feature = "ingest-v4l2")]
    {
        Ok(Box::new(V4l2Source::new(device)))
    }
    #[cfg(not(feature = "ingest-v4l2"))]
    {
        anyhow::bail!(
            "camera device {} requires the ingest-v4l2 feature",
            device
        )
    }
}
