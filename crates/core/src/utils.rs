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

//! Utility functions for camview

use crate::{FourCc, FrameSize};

/// Bytes per pixel of packed single-plane encodings
pub fn bytes_per_pixel(fourcc: FourCc) -> Option<usize> {
    match &fourcc.0 {
        b"YUYV" | b"UYVY" | b"YVYU" | b"VYUY" | b"RGBP" => Some(2),
        b"RGB3" | b"BGR3" => Some(3),
        b"RGB4" | b"BGR4" | b"AR24" | b"XR24" => Some(4),
        b"GREY" => Some(1),
        _ => None,
    }
}

/// Row stride for `width` pixels, two bytes per pixel when unknown
pub fn row_stride(width: u32, fourcc: FourCc) -> usize {
    width as usize * bytes_per_pixel(fourcc).unwrap_or(2)
}

/// Size of one tightly packed frame
pub fn frame_bytes(size: FrameSize, fourcc: FourCc) -> usize {
    row_stride(size.width, fourcc) * size.height as usize
}

/// Format duration for display
pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}.{:01}s", secs, duration.subsec_millis() / 100)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Average frames per second over `elapsed`
pub fn average_fps(frames: u64, elapsed: std::time::Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        0.0
    } else {
        frames as f64 / secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_yuyv_stride_is_two_bytes_per_pixel() {
        assert_eq!(row_stride(640, FourCc::YUYV), 1280);
        assert_eq!(frame_bytes(FrameSize::vga(), FourCc::YUYV), 640 * 480 * 2);
        assert_eq!(bytes_per_pixel(FourCc::MJPG), None);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(2500)), "2.5s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(7260)), "2h 1m");
    }

    #[test]
    fn test_average_fps() {
        assert_eq!(average_fps(60, Duration::from_secs(2)), 30.0);
        assert_eq!(average_fps(10, Duration::ZERO), 0.0);
    }
}
