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

//! Capture device protocol.
//!
//! This is the control surface of a V4L2-style streaming device as the
//! capture core consumes it. Every call reports failures as the raw
//! [`io::Error`] of the underlying request so callers can tell transient
//! conditions (`EAGAIN`, `EINTR`, `EIO`) from fatal ones; implementations
//! retry interrupted control calls themselves.

use crate::{BufferInfo, Capabilities, CaptureFormat, DequeuedBuffer, FrameInterval, MappedRegion};
use std::io;
use std::path::Path;
use std::time::Duration;

pub trait CaptureDevice: Send + Sync {
    /// Path the device was opened from
    fn path(&self) -> &Path;

    /// `VIDIOC_QUERYCAP`
    fn query_capabilities(&self) -> io::Result<Capabilities>;

    /// `VIDIOC_S_FMT`; returns what the driver wrote back into the request.
    fn set_format(&self, format: &CaptureFormat) -> io::Result<CaptureFormat>;

    /// `VIDIOC_G_FMT`
    fn get_format(&self) -> io::Result<CaptureFormat>;

    /// `VIDIOC_S_PARM` with the capture time per frame
    fn set_frame_interval(&self, interval: FrameInterval) -> io::Result<()>;

    /// `VIDIOC_REQBUFS` for memory-mapped buffers; returns the granted count.
    fn request_buffers(&self, count: u32) -> io::Result<u32>;

    /// `VIDIOC_QUERYBUF`
    fn query_buffer(&self, index: u32) -> io::Result<BufferInfo>;

    /// Map one queried buffer slot into process memory.
    fn map_buffer(&self, info: &BufferInfo) -> io::Result<MappedRegion>;

    /// Unmap a region previously returned by [`CaptureDevice::map_buffer`].
    fn unmap_buffer(&self, region: MappedRegion) -> io::Result<()>;

    /// `VIDIOC_QBUF`
    fn queue_buffer(&self, index: u32) -> io::Result<()>;

    /// `VIDIOC_DQBUF`
    fn dequeue_buffer(&self) -> io::Result<DequeuedBuffer>;

    /// `VIDIOC_STREAMON`
    fn stream_on(&self) -> io::Result<()>;

    /// `VIDIOC_STREAMOFF`
    fn stream_off(&self) -> io::Result<()>;

    /// Block until the device is readable or `timeout` expires.
    ///
    /// Returns `Ok(false)` on timeout. An interrupted wait is reported as
    /// [`io::ErrorKind::Interrupted`] and not retried here.
    fn wait_ready(&self, timeout: Duration) -> io::Result<bool>;

    /// Close the device descriptor. Later calls fail with `EBADF`.
    fn close(&self) -> io::Result<()>;
}
