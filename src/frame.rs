//! Encoded frame container and the JPEG encoder that produces it.
//!
//! - `PixelSurface`: borrowed view of the live pixels a `FrameSource` exposes.
//! - `Frame`: owned, encoded still image. Not `Clone`; ownership moves into the
//!   transport on send and the frame is dropped once it has been written out.
//! - `FrameEncoder`: rasterizes a surface into a JPEG at a fixed quality.
//!
//! The encoder never keeps a reference into the surface after `encode` returns,
//! so a frame survives any later change to the device buffers.

use anyhow::{anyhow, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use std::time::{SystemTime, UNIX_EPOCH};

/// MIME type of every frame this crate produces.
pub const JPEG_MIME: &str = "image/jpeg";

/// Default JPEG quality used when none is configured.
pub const DEFAULT_JPEG_QUALITY: f32 = 0.7;

// ----------------------------------------------------------------------------
// PixelSurface: live pixels borrowed from a source
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb8,
    /// Single-channel grey, as delivered by monochrome V4L2 devices.
    Luma8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            PixelFormat::Luma8 => 1,
        }
    }

    fn color_type(self) -> ExtendedColorType {
        match self {
            PixelFormat::Rgb8 => ExtendedColorType::Rgb8,
            PixelFormat::Luma8 => ExtendedColorType::L8,
        }
    }
}

/// Borrowed view of the pixels currently held by a frame source.
///
/// A zero-area surface means the source is open but has not delivered an
/// image yet.
#[derive(Clone, Copy, Debug)]
pub struct PixelSurface<'a> {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    data: &'a [u8],
}

impl<'a> PixelSurface<'a> {
    pub fn new(data: &'a [u8], width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            data,
        }
    }

    /// Surface of a source that is not ready yet.
    pub fn not_ready() -> PixelSurface<'static> {
        PixelSurface {
            width: 0,
            height: 0,
            format: PixelFormat::Rgb8,
            data: &[],
        }
    }

    pub fn is_ready(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Number of bytes a full image of these dimensions occupies.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }

    pub(crate) fn data(&self) -> &'a [u8] {
        self.data
    }
}

// ----------------------------------------------------------------------------
// Frame: owned encoded still image
// ----------------------------------------------------------------------------

/// One encoded still image captured from the live source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Vec<u8>,
    pub mime: &'static str,
    /// Wall-clock capture time in milliseconds since the Unix epoch.
    pub captured_at_ms: u64,
    /// Monotonically increasing per encoder.
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

// ----------------------------------------------------------------------------
// FrameEncoder
// ----------------------------------------------------------------------------

/// JPEG encoder with a fixed quality.
#[derive(Debug)]
pub struct FrameEncoder {
    quality: u8,
    next_sequence: u64,
}

impl FrameEncoder {
    /// `quality` must lie in `(0, 1]`.
    pub fn new(quality: f32) -> Result<Self> {
        if !(quality > 0.0 && quality <= 1.0) {
            return Err(anyhow!(
                "jpeg quality must be in (0, 1], got {}",
                quality
            ));
        }
        Ok(Self {
            quality: (quality * 100.0).round().clamp(1.0, 100.0) as u8,
            next_sequence: 0,
        })
    }

    /// JPEG quality on the 1..=100 scale.
    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Sequence number the next encoded frame will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Encode the surface into a frame.
    ///
    /// Returns `None` when the surface is not ready (zero area) or when the
    /// pixel buffer cannot be encoded; both mean "skip this tick".
    pub fn encode(&mut self, surface: &PixelSurface<'_>) -> Option<Frame> {
        if !surface.is_ready() {
            return None;
        }
        let payload = match self.encode_jpeg(surface) {
            Ok(payload) => payload,
            Err(err) => {
                log::warn!(
                    "FrameEncoder: dropping {}x{} surface: {}",
                    surface.width,
                    surface.height,
                    err
                );
                return None;
            }
        };

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Some(Frame {
            payload,
            mime: JPEG_MIME,
            captured_at_ms: epoch_millis(),
            sequence,
            width: surface.width,
            height: surface.height,
        })
    }

    fn encode_jpeg(&self, surface: &PixelSurface<'_>) -> Result<Vec<u8>> {
        let expected = surface.expected_len();
        let data = surface.data();
        if data.len() < expected {
            return Err(anyhow!(
                "pixel buffer too short: expected {} bytes, got {}",
                expected,
                data.len()
            ));
        }

        let mut payload = Vec::with_capacity(expected / 8);
        let mut encoder = JpegEncoder::new_with_quality(&mut payload, self.quality);
        encoder
            .encode(
                &data[..expected],
                surface.width,
                surface.height,
                surface.format.color_type(),
            )
            .map_err(|e| anyhow!("jpeg encode failed: {}", e))?;
        Ok(payload)
    }
}

/// Milliseconds since the Unix epoch, saturating to zero on a clock before 1970.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
