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

//! Core types for camview

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ptr::NonNull;
use std::str::FromStr;

/// Frame or window size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub const fn new(width: u32, height: u32) -> Self {
        FrameSize { width, height }
    }

    pub fn vga() -> Self {
        FrameSize::new(640, 480)
    }

    /// Shrink each dimension to fit within `bound`.
    pub fn clamp_to(self, bound: FrameSize) -> Self {
        FrameSize::new(self.width.min(bound.width), self.height.min(bound.height))
    }

    /// Pack into a single word, width in the high half.
    pub const fn pack(self) -> u64 {
        ((self.width as u64) << 32) | self.height as u64
    }

    pub const fn unpack(packed: u64) -> Self {
        FrameSize {
            width: (packed >> 32) as u32,
            height: packed as u32,
        }
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Four character pixel encoding code, stored little-endian as the kernel does
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const YUYV: FourCc = FourCc(*b"YUYV");
    pub const UYVY: FourCc = FourCc(*b"UYVY");
    pub const MJPG: FourCc = FourCc(*b"MJPG");

    pub const fn from_u32(code: u32) -> Self {
        FourCc(code.to_le_bytes())
    }

    pub const fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            let c = if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({})", self)
    }
}

impl FromStr for FourCc {
    type Err = crate::CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 || !bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            return Err(crate::CaptureError::Config(format!(
                "pixel format must be four ASCII characters, got {:?}",
                s
            )));
        }
        Ok(FourCc([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// Field order of captured images (`enum v4l2_field`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldOrder {
    Any,
    None,
    Top,
    Bottom,
    Interlaced,
    SeqTb,
    SeqBt,
    Alternate,
    InterlacedTb,
    InterlacedBt,
    Unknown(u32),
}

impl FieldOrder {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => FieldOrder::Any,
            1 => FieldOrder::None,
            2 => FieldOrder::Top,
            3 => FieldOrder::Bottom,
            4 => FieldOrder::Interlaced,
            5 => FieldOrder::SeqTb,
            6 => FieldOrder::SeqBt,
            7 => FieldOrder::Alternate,
            8 => FieldOrder::InterlacedTb,
            9 => FieldOrder::InterlacedBt,
            other => FieldOrder::Unknown(other),
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            FieldOrder::Any => 0,
            FieldOrder::None => 1,
            FieldOrder::Top => 2,
            FieldOrder::Bottom => 3,
            FieldOrder::Interlaced => 4,
            FieldOrder::SeqTb => 5,
            FieldOrder::SeqBt => 6,
            FieldOrder::Alternate => 7,
            FieldOrder::InterlacedTb => 8,
            FieldOrder::InterlacedBt => 9,
            FieldOrder::Unknown(raw) => raw,
        }
    }
}

/// Buffer strategy used to move frames out of the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoMethod {
    Read,
    Mmap,
    UserPtr,
}

impl fmt::Display for IoMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IoMethod::Read => "read",
            IoMethod::Mmap => "mmap",
            IoMethod::UserPtr => "userptr",
        };
        f.write_str(name)
    }
}

/// Single-planar capture format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub size: FrameSize,
    pub fourcc: FourCc,
    pub field: FieldOrder,
    /// Filled in by the driver; zero when requesting.
    pub bytes_per_line: u32,
    /// Filled in by the driver; zero when requesting.
    pub size_image: u32,
}

impl CaptureFormat {
    pub fn request(size: FrameSize, fourcc: FourCc, field: FieldOrder) -> Self {
        CaptureFormat {
            size,
            fourcc,
            field,
            bytes_per_line: 0,
            size_image: 0,
        }
    }
}

/// Device capabilities reported by `VIDIOC_QUERYCAP`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub version: u32,
    pub capabilities: u32,
}

impl Capabilities {
    pub const VIDEO_CAPTURE: u32 = 0x0000_0001;
    pub const STREAMING: u32 = 0x0400_0000;

    pub fn supports_video_capture(&self) -> bool {
        self.capabilities & Self::VIDEO_CAPTURE != 0
    }

    pub fn supports_streaming(&self) -> bool {
        self.capabilities & Self::STREAMING != 0
    }
}

/// Time per frame as a fraction of seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInterval {
    pub numerator: u32,
    pub denominator: u32,
}

impl FrameInterval {
    pub fn from_fps(fps: u32) -> Self {
        FrameInterval {
            numerator: 1,
            denominator: fps,
        }
    }
}

/// Location of one kernel buffer slot inside the device's mmap space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub index: u32,
    pub length: u32,
    pub offset: u32,
}

/// Validity of a dequeued buffer
///
/// There is no "not yet filled" variant: a slot the driver has not filled
/// stays on its incoming queue and `VIDIOC_DQBUF` reports `EAGAIN` for it
/// instead of handing it back, so a dequeued descriptor is always one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Filled,
    /// Driver flagged the data as possibly corrupted (`V4L2_BUF_FLAG_ERROR` / `EIO`).
    Error,
}

/// Buffer handed back by `VIDIOC_DQBUF`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: u32,
    pub sequence: u32,
    pub state: BufferState,
}

/// A buffer slot mapped into process memory.
///
/// Only the owning buffer pool reads through this region, and only while the
/// slot is dequeued.
#[derive(Debug)]
pub struct MappedRegion {
    start: NonNull<u8>,
    length: usize,
}

// SAFETY: the region is plain shared memory; access is serialized by the
// dequeue/queue protocol of the owning pool.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// # Safety
    ///
    /// `start` must point to `length` readable bytes that stay valid until the
    /// region is handed back to the device that produced it.
    pub unsafe fn from_raw_parts(start: NonNull<u8>, length: usize) -> Self {
        MappedRegion { start, length }
    }

    pub fn start(&self) -> *mut u8 {
        self.start.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// # Safety
    ///
    /// The caller must own the slot (dequeued, not yet re-queued) for the
    /// lifetime of the returned slice.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.start.as_ptr(), self.length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_packing() {
        let size = FrameSize::new(800, 600);
        assert_eq!(FrameSize::unpack(size.pack()), size);
        assert_eq!(FrameSize::unpack(FrameSize::new(u32::MAX, 1).pack()).width, u32::MAX);
    }

    #[test]
    fn test_fourcc_roundtrip_with_kernel_code() {
        // V4L2_PIX_FMT_YUYV
        assert_eq!(FourCc::YUYV.to_u32(), 0x5659_5559);
        assert_eq!(FourCc::from_u32(0x5659_5559), FourCc::YUYV);
        assert_eq!(FourCc::YUYV.to_string(), "YUYV");
        assert_eq!("MJPG".parse::<FourCc>().unwrap(), FourCc::MJPG);
        assert!("YUV".parse::<FourCc>().is_err());
    }

    #[test]
    fn test_capability_flags() {
        let caps = Capabilities {
            driver: "uvcvideo".to_string(),
            card: "Integrated Camera".to_string(),
            bus_info: "usb-0000:00:14.0-8".to_string(),
            version: 0,
            capabilities: Capabilities::VIDEO_CAPTURE,
        };
        assert!(caps.supports_video_capture());
        assert!(!caps.supports_streaming());
    }

    #[test]
    fn test_field_order_raw() {
        assert_eq!(FieldOrder::from_raw(4), FieldOrder::Interlaced);
        assert_eq!(FieldOrder::Unknown(42).to_raw(), 42);
    }
}
