//! Synthetic frame source.
//!
//! `stub://` devices produce a deterministic test pattern so the whole capture
//! pipeline can run without hardware. The host part of the URL selects a
//! behaviour:
//!
//! - `stub://denied` fails to open with `PermissionDenied`
//! - `stub://missing` fails to open with `DeviceNotFound`
//! - `stub://unsupported` fails to open with `DeviceUnsupported`
//! - any other host opens normally
//!
//! Query parameters tune a normal device:
//! - `warmup=N` yields N zero-area surfaces before the first image
//! - `lose_after=N` reports the device lost after N images

use url::Url;

use super::{AcquisitionError, CaptureConstraints, FrameSource};
use crate::frame::{PixelFormat, PixelSurface};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Behavior {
    Normal,
    Denied,
    Missing,
    Unsupported,
}

/// Deterministic synthetic camera.
#[derive(Debug)]
pub struct SyntheticSource {
    device: String,
    behavior: Behavior,
    warmup: u32,
    lose_after: Option<u64>,
    open: bool,
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    surfaces_served: u64,
    frames_delivered: u64,
}

impl SyntheticSource {
    pub fn new(device: &str) -> Self {
        let (behavior, warmup, lose_after) = parse_device(device);
        Self {
            device: device.to_string(),
            behavior,
            warmup,
            lose_after,
            open: false,
            width: 0,
            height: 0,
            pixels: Vec::new(),
            surfaces_served: 0,
            frames_delivered: 0,
        }
    }

    /// Fill the pixel buffer with a pattern that drifts every frame.
    fn render(&mut self) {
        let len = self.width as usize * self.height as usize * 3;
        self.pixels.resize(len, 0);
        let phase = self.frames_delivered;
        for (i, pixel) in self.pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + phase) % 256) as u8;
        }
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &str {
        &self.device
    }

    fn open(&mut self, constraints: &CaptureConstraints) -> Result<(), AcquisitionError> {
        match self.behavior {
            Behavior::Denied => {
                return Err(AcquisitionError::PermissionDenied(self.device.clone()))
            }
            Behavior::Missing => return Err(AcquisitionError::DeviceNotFound(self.device.clone())),
            Behavior::Unsupported => {
                return Err(AcquisitionError::DeviceUnsupported {
                    device: self.device.clone(),
                    reason: "synthetic device rejects every format".to_string(),
                })
            }
            Behavior::Normal => {}
        }
        if self.open {
            return Ok(());
        }

        self.width = if constraints.ideal_width == 0 {
            640
        } else {
            constraints.ideal_width
        };
        self.height = if constraints.ideal_height == 0 {
            480
        } else {
            constraints.ideal_height
        };
        self.surfaces_served = 0;
        self.open = true;
        log::info!(
            "SyntheticSource: opened {} ({}x{})",
            self.device,
            self.width,
            self.height
        );
        Ok(())
    }

    fn surface(&mut self) -> Result<PixelSurface<'_>, AcquisitionError> {
        if !self.open {
            return Err(AcquisitionError::Unknown(format!(
                "{} is not open",
                self.device
            )));
        }
        self.surfaces_served += 1;
        if self.surfaces_served <= self.warmup as u64 {
            return Ok(PixelSurface::not_ready());
        }
        if let Some(limit) = self.lose_after {
            if self.frames_delivered >= limit {
                return Err(AcquisitionError::DeviceLost(self.device.clone()));
            }
        }

        self.render();
        self.frames_delivered += 1;
        Ok(PixelSurface::new(
            &self.pixels,
            self.width,
            self.height,
            PixelFormat::Rgb8,
        ))
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        self.open.then_some((self.width, self.height))
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        if self.open {
            log::info!("SyntheticSource: released {}", self.device);
        }
        self.open = false;
        self.pixels = Vec::new();
    }
}

fn parse_device(device: &str) -> (Behavior, u32, Option<u64>) {
    let Ok(url) = Url::parse(device) else {
        return (Behavior::Normal, 0, None);
    };
    let behavior = match url.host_str() {
        Some("denied") => Behavior::Denied,
        Some("missing") => Behavior::Missing,
        Some("unsupported") => Behavior::Unsupported,
        _ => Behavior::Normal,
    };
    let mut warmup = 0;
    let mut lose_after = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "warmup" => warmup = value.parse().unwrap_or(0),
            "lose_after" => lose_after = value.parse().ok(),
            other => log::debug!("SyntheticSource: ignoring query parameter {}", other),
        }
    }
    (behavior, warmup, lose_after)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_requested_dimensions() {
        let mut source = SyntheticSource::new("stub://camera");
        source
            .open(&CaptureConstraints::default())
            .expect("open");
        assert_eq!(source.dimensions(), Some((640, 480)));

        let surface = source.surface().expect("surface");
        assert!(surface.is_ready());
        assert_eq!(surface.expected_len(), 640 * 480 * 3);
    }

    #[test]
    fn warmup_yields_not_ready_surfaces() {
        let mut source = SyntheticSource::new("stub://camera?warmup=2");
        source
            .open(&CaptureConstraints::default())
            .expect("open");
        assert!(!source.surface().expect("first").is_ready());
        assert!(!source.surface().expect("second").is_ready());
        assert!(source.surface().expect("third").is_ready());
    }

    #[test]
    fn failure_hosts_map_to_acquisition_errors() {
        let constraints = CaptureConstraints::default();
        assert!(matches!(
            SyntheticSource::new("stub://denied").open(&constraints),
            Err(AcquisitionError::PermissionDenied(_))
        ));
        assert!(matches!(
            SyntheticSource::new("stub://missing").open(&constraints),
            Err(AcquisitionError::DeviceNotFound(_))
        ));
        assert!(matches!(
            SyntheticSource::new("stub://unsupported").open(&constraints),
            Err(AcquisitionError::DeviceUnsupported { .. })
        ));
    }

    #[test]
    fn device_loss_after_limit() {
        let mut source = SyntheticSource::new("stub://camera?lose_after=1");
        source
            .open(&CaptureConstraints::default())
            .expect("open");
        assert!(source.surface().is_ok());
        assert!(matches!(
            source.surface(),
            Err(AcquisitionError::DeviceLost(_))
        ));
    }

    #[test]
    fn close_is_idempotent_and_safe_before_open() {
        let mut source = SyntheticSource::new("stub://camera");
        source.close();
        source
            .open(&CaptureConstraints::default())
            .expect("open");
        source.close();
        source.close();
        assert!(!source.is_open());
        assert_eq!(source.dimensions(), None);
        assert!(source.surface().is_err());
    }
}
