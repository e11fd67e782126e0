// Copyright 2024 Soft KVM Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Capability check and format negotiation

use camview_core::*;
use tracing::{debug, info};

/// Format negotiation against one open device
pub struct FormatNegotiator<'a> {
    device: &'a dyn CaptureDevice,
}

impl<'a> FormatNegotiator<'a> {
    pub fn new(device: &'a dyn CaptureDevice) -> Self {
        FormatNegotiator { device }
    }

    /// Require video capture and streaming I/O support.
    pub fn query_capabilities(&self) -> CaptureResult<Capabilities> {
        let path = self.device.path().to_path_buf();
        let caps = self.device.query_capabilities().map_err(|e| {
            if matches!(e.raw_os_error(), Some(libc::EINVAL | libc::ENOTTY)) {
                CaptureError::NotV4l2Device(path.clone())
            } else {
                CaptureError::ioctl("VIDIOC_QUERYCAP", e)
            }
        })?;

        if !caps.supports_video_capture() {
            return Err(CaptureError::NoVideoCapture(path));
        }
        if !caps.supports_streaming() {
            return Err(CaptureError::NoStreaming(path));
        }

        info!("Device {} is '{}' ({}, {})", path.display(), caps.card, caps.driver, caps.bus_info);
        Ok(caps)
    }

    /// Request a capture format. Field order is always interlaced.
    ///
    /// The driver may adjust the request; read the result back with
    /// [`FormatNegotiator::get_format`].
    pub fn set_format(&self, size: FrameSize, fourcc: FourCc) -> CaptureResult<()> {
        let request = CaptureFormat::request(size, fourcc, FieldOrder::Interlaced);
        let adjusted = self
            .device
            .set_format(&request)
            .map_err(|e| CaptureError::ioctl("VIDIOC_S_FMT", e))?;
        debug!("Requested {} {}, driver answered {} {}", fourcc, size, adjusted.fourcc, adjusted.size);
        Ok(())
    }

    /// Read back the negotiated format.
    pub fn get_format(&self) -> CaptureResult<CaptureFormat> {
        let format = self
            .device
            .get_format()
            .map_err(|e| CaptureError::ioctl("VIDIOC_G_FMT", e))?;

        info!(
            "Negotiated format: pixelformat={} width={} height={} field={:?} bytesperline={} sizeimage={}",
            format.fourcc,
            format.size.width,
            format.size.height,
            format.field,
            format.bytes_per_line,
            format.size_image
        );
        Ok(format)
    }

    /// Set the capture rate as a time per frame of `1 / fps`.
    pub fn set_frame_rate(&self, fps: u32) -> CaptureResult<()> {
        let interval = FrameInterval::from_fps(fps);
        self.device
            .set_frame_interval(interval)
            .map_err(|e| CaptureError::ioctl("VIDIOC_S_PARM", e))?;
        debug!("Frame interval set to {}/{}", interval.numerator, interval.denominator);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimulatedDevice, SimulatedDeviceConfig};

    #[test]
    fn test_rejects_device_without_streaming() {
        let device = SimulatedDevice::new(SimulatedDeviceConfig {
            capabilities: Capabilities::VIDEO_CAPTURE,
            ..SimulatedDeviceConfig::default()
        });
        let result = FormatNegotiator::new(&device).query_capabilities();
        assert!(matches!(result, Err(CaptureError::NoStreaming(_))));
    }

    #[test]
    fn test_rejects_output_only_device() {
        let device = SimulatedDevice::new(SimulatedDeviceConfig {
            capabilities: Capabilities::STREAMING,
            ..SimulatedDeviceConfig::default()
        });
        let result = FormatNegotiator::new(&device).query_capabilities();
        assert!(matches!(result, Err(CaptureError::NoVideoCapture(_))));
    }

    #[test]
    fn test_driver_may_adjust_requested_format() {
        let device = SimulatedDevice::new(SimulatedDeviceConfig {
            max_size: FrameSize::new(320, 240),
            ..SimulatedDeviceConfig::default()
        });
        let negotiator = FormatNegotiator::new(&device);
        negotiator.set_format(FrameSize::vga(), FourCc::YUYV).unwrap();

        let format = negotiator.get_format().unwrap();
        assert_eq!(format.size, FrameSize::new(320, 240));
        assert_eq!(format.field, FieldOrder::Interlaced);
        assert_eq!(format.bytes_per_line, 640);
    }

    #[test]
    fn test_frame_rate_is_one_over_fps() {
        let device = SimulatedDevice::new(SimulatedDeviceConfig::default());
        FormatNegotiator::new(&device).set_frame_rate(25).unwrap();
        assert_eq!(device.frame_interval(), Some(FrameInterval::from_fps(25)));
    }
}
