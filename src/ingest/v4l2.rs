//! V4L2 frame source.
//!
//! This module provides `V4l2Source` for capturing from local V4L2 devices
//! (e.g. /dev/video0) via memory-mapped buffers.
//!
//! The V4L2 source is responsible for:
//! - Negotiating RGB24 (or 8-bit grey on monochrome sensors) close to the
//!   requested constraints
//! - Reporting the format the device actually accepted
//! - Copying each captured buffer into a surface owned by the source
//! - Releasing the device and its buffers on `close`

use ouroboros::self_referencing;

use super::{AcquisitionError, CaptureConstraints, FrameSource};
use crate::frame::{PixelFormat, PixelSurface};

const BUFFER_COUNT: u32 = 4;
const RGB24: &[u8; 4] = b"RGB3";
const GREY: &[u8; 4] = b"GREY";

/// V4L2 camera source.
pub struct V4l2Source {
    device: String,
    state: Option<DeviceV4l2State>,
    pixels: Vec<u8>,
    format: PixelFormat,
    width: u32,
    height: u32,
}

#[self_referencing]
struct DeviceV4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
            state: None,
            pixels: Vec::new(),
            format: PixelFormat::Rgb8,
            width: 0,
            height: 0,
        }
    }

    /// Ask the device for `fourcc` at the requested size and return the
    /// format it actually settled on.
    fn request_format(
        &self,
        device: &v4l::Device,
        constraints: &CaptureConstraints,
        fourcc: &[u8; 4],
    ) -> Result<v4l::Format, AcquisitionError> {
        use v4l::video::Capture;

        let mut format = device
            .format()
            .map_err(|err| AcquisitionError::from_io(&self.device, &err))?;
        format.width = constraints.ideal_width;
        format.height = constraints.ideal_height;
        format.fourcc = v4l::FourCC::new(fourcc);

        match device.set_format(&format) {
            Ok(format) => Ok(format),
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set {} on {}: {}",
                    format.fourcc,
                    self.device,
                    err
                );
                device
                    .format()
                    .map_err(|err| AcquisitionError::from_io(&self.device, &err))
            }
        }
    }
}

impl FrameSource for V4l2Source {
    fn name(&self) -> &str {
        &self.device
    }

    fn open(&mut self, constraints: &CaptureConstraints) -> Result<(), AcquisitionError> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        if self.state.is_some() {
            return Ok(());
        }

        let mut device = v4l::Device::with_path(&self.device)
            .map_err(|err| AcquisitionError::from_io(&self.device, &err))?;
        let mut format = self.request_format(&device, constraints, RGB24)?;
        if format.fourcc != v4l::FourCC::new(RGB24) {
            format = self.request_format(&device, constraints, GREY)?;
        }
        let pixel_format = if format.fourcc == v4l::FourCC::new(RGB24) {
            PixelFormat::Rgb8
        } else if format.fourcc == v4l::FourCC::new(GREY) {
            PixelFormat::Luma8
        } else {
            return Err(AcquisitionError::DeviceUnsupported {
                device: self.device.clone(),
                reason: format!("device only offers {}", format.fourcc),
            });
        };

        if constraints.ideal_frame_rate > 0 {
            let params = v4l::video::capture::Parameters::with_fps(constraints.ideal_frame_rate);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Source: failed to set fps on {}: {}",
                    self.device,
                    err
                );
            }
        }

        let state = DeviceV4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, BUFFER_COUNT)
            },
        }
        .try_build()
        .map_err(|err| AcquisitionError::Unknown(format!("{}: {}", self.device, err)))?;

        self.width = format.width;
        self.height = format.height;
        self.format = pixel_format;
        self.state = Some(state);
        log::info!(
            "V4l2Source: opened {} ({}x{} {:?})",
            self.device,
            self.width,
            self.height,
            self.format
        );
        Ok(())
    }

    fn surface(&mut self) -> Result<PixelSurface<'_>, AcquisitionError> {
        use v4l::io::traits::CaptureStream;

        let state = self
            .state
            .as_mut()
            .ok_or_else(|| AcquisitionError::Unknown(format!("{} is not open", self.device)))?;
        let pixels = &mut self.pixels;
        state
            .with_mut(|fields| -> std::io::Result<()> {
                let (buf, _meta) = fields.stream.next()?;
                pixels.clear();
                pixels.extend_from_slice(buf);
                Ok(())
            })
            .map_err(|err| {
                log::warn!("V4l2Source: capture on {} failed: {}", self.device, err);
                AcquisitionError::DeviceLost(self.device.clone())
            })?;

        Ok(PixelSurface::new(
            &self.pixels,
            self.width,
            self.height,
            self.format,
        ))
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        self.state.as_ref().map(|_| (self.width, self.height))
    }

    fn is_open(&self) -> bool {
        self.state.is_some()
    }

    fn close(&mut self) {
        if self.state.take().is_some() {
            log::info!("V4l2Source: released {}", self.device);
        }
        self.pixels = Vec::new();
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        self.close();
    }
}
