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

//! V4L2 capture device over a non-blocking character device.

use crate::sys::*;
use camview_core::*;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::fd::{IntoRawFd, RawFd};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use tracing::{debug, trace, warn};

const CLOSED: RawFd = -1;

/// Index handed to `VIDIOC_DQBUF`; stays put when the driver dequeues nothing.
const NO_INDEX: u32 = u32::MAX;

/// Capture device opened read/write and non-blocking.
///
/// The descriptor is closed by [`CaptureDevice::close`]; later calls fail
/// with `EBADF`. Dropping an open device closes it as well.
#[derive(Debug)]
pub struct V4l2Device {
    path: PathBuf,
    fd: AtomicI32,
}

impl V4l2Device {
    /// Open `path`, which must be a character device.
    pub fn open(path: impl AsRef<Path>) -> CaptureResult<Self> {
        let path = path.as_ref();
        let metadata = fs::metadata(path).map_err(|source| CaptureError::DeviceNotFound {
            path: path.to_path_buf(),
            source,
        })?;
        if !metadata.file_type().is_char_device() {
            return Err(CaptureError::NotCharDevice(path.to_path_buf()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|source| CaptureError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        debug!("Opened {}", path.display());
        Ok(V4l2Device {
            path: path.to_path_buf(),
            fd: AtomicI32::new(file.into_raw_fd()),
        })
    }

    fn raw_fd(&self) -> io::Result<RawFd> {
        match self.fd.load(Ordering::Acquire) {
            CLOSED => Err(io::Error::from_raw_os_error(libc::EBADF)),
            fd => Ok(fd),
        }
    }

    /// ioctl retried while interrupted by a signal
    fn xioctl<T>(&self, request: libc::c_ulong, arg: &mut T) -> io::Result<()> {
        let fd = self.raw_fd()?;
        loop {
            // SAFETY: `request` encodes the size of `T`, which is the
            // matching repr(C) argument struct, and `arg` is a live
            // exclusive reference for the duration of the call.
            let ret = unsafe { libc::ioctl(fd, request as _, arg as *mut T) };
            if ret != -1 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn capture_buffer(index: u32) -> v4l2_buffer {
        v4l2_buffer {
            index,
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory: V4L2_MEMORY_MMAP,
            ..Default::default()
        }
    }
}

fn capture_format(pix: &v4l2_pix_format) -> CaptureFormat {
    CaptureFormat {
        size: FrameSize::new(pix.width, pix.height),
        fourcc: FourCc::from_u32(pix.pixelformat),
        field: FieldOrder::from_raw(pix.field),
        bytes_per_line: pix.bytesperline,
        size_image: pix.sizeimage,
    }
}

impl CaptureDevice for V4l2Device {
    fn path(&self) -> &Path {
        &self.path
    }

    fn query_capabilities(&self) -> io::Result<Capabilities> {
        let mut cap = v4l2_capability::default();
        self.xioctl(VIDIOC_QUERYCAP, &mut cap)?;
        Ok(Capabilities {
            driver: c_field(&cap.driver),
            card: c_field(&cap.card),
            bus_info: c_field(&cap.bus_info),
            version: cap.version,
            capabilities: cap.capabilities,
        })
    }

    fn set_format(&self, format: &CaptureFormat) -> io::Result<CaptureFormat> {
        let mut fmt = v4l2_format {
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            ..Default::default()
        };
        fmt.fmt.pix = v4l2_pix_format {
            width: format.size.width,
            height: format.size.height,
            pixelformat: format.fourcc.to_u32(),
            field: format.field.to_raw(),
            ..Default::default()
        };
        self.xioctl(VIDIOC_S_FMT, &mut fmt)?;
        // SAFETY: `pix` is the active member for VIDEO_CAPTURE formats
        Ok(capture_format(unsafe { &fmt.fmt.pix }))
    }

    fn get_format(&self) -> io::Result<CaptureFormat> {
        let mut fmt = v4l2_format {
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            ..Default::default()
        };
        self.xioctl(VIDIOC_G_FMT, &mut fmt)?;
        // SAFETY: `pix` is the active member for VIDEO_CAPTURE formats
        Ok(capture_format(unsafe { &fmt.fmt.pix }))
    }

    fn set_frame_interval(&self, interval: FrameInterval) -> io::Result<()> {
        let mut parm = v4l2_streamparm {
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            ..Default::default()
        };
        parm.parm.capture = v4l2_captureparm {
            timeperframe: v4l2_fract {
                numerator: interval.numerator,
                denominator: interval.denominator,
            },
            ..Default::default()
        };
        self.xioctl(VIDIOC_S_PARM, &mut parm)?;
        // SAFETY: `capture` is the active member for VIDEO_CAPTURE
        let applied = unsafe { parm.parm.capture.timeperframe };
        if applied.numerator != interval.numerator || applied.denominator != interval.denominator {
            debug!(
                "Driver set frame interval {}/{} instead of {}/{}",
                applied.numerator, applied.denominator, interval.numerator, interval.denominator
            );
        }
        Ok(())
    }

    fn request_buffers(&self, count: u32) -> io::Result<u32> {
        let mut req = v4l2_requestbuffers {
            count,
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory: V4L2_MEMORY_MMAP,
            ..Default::default()
        };
        self.xioctl(VIDIOC_REQBUFS, &mut req)?;
        Ok(req.count)
    }

    fn query_buffer(&self, index: u32) -> io::Result<BufferInfo> {
        let mut buf = Self::capture_buffer(index);
        self.xioctl(VIDIOC_QUERYBUF, &mut buf)?;
        Ok(BufferInfo {
            index,
            length: buf.length,
            // SAFETY: `offset` is the active member for MMAP buffers
            offset: unsafe { buf.m.offset },
        })
    }

    fn map_buffer(&self, info: &BufferInfo) -> io::Result<MappedRegion> {
        let fd = self.raw_fd()?;
        let length = info.length as usize;
        // SAFETY: mapping a driver buffer at the offset QUERYBUF reported;
        // the result is checked before use.
        let start = unsafe {
            libc::mmap(
                ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                info.offset as libc::off_t,
            )
        };
        if start == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let start = NonNull::new(start.cast::<u8>()).ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
        trace!("Mapped buffer {} ({} bytes)", info.index, length);
        // SAFETY: the mapping stays valid until `unmap_buffer`
        Ok(unsafe { MappedRegion::from_raw_parts(start, length) })
    }

    fn unmap_buffer(&self, region: MappedRegion) -> io::Result<()> {
        // SAFETY: `region` came from `map_buffer` and is consumed here
        let ret = unsafe { libc::munmap(region.start().cast::<libc::c_void>(), region.len()) };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn queue_buffer(&self, index: u32) -> io::Result<()> {
        let mut buf = Self::capture_buffer(index);
        self.xioctl(VIDIOC_QBUF, &mut buf)?;
        trace!("Queued buffer {}", index);
        Ok(())
    }

    fn dequeue_buffer(&self) -> io::Result<DequeuedBuffer> {
        let mut buf = Self::capture_buffer(NO_INDEX);
        let result = self.xioctl(VIDIOC_DQBUF, &mut buf);
        let dequeued = dequeued(result, &buf)?;
        trace!("Dequeued buffer {} ({} bytes, seq {})", buf.index, buf.bytesused, buf.sequence);
        Ok(dequeued)
    }

    fn stream_on(&self) -> io::Result<()> {
        let mut kind = V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        self.xioctl(VIDIOC_STREAMON, &mut kind)
    }

    fn stream_off(&self) -> io::Result<()> {
        let mut kind = V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        self.xioctl(VIDIOC_STREAMOFF, &mut kind)
    }

    fn wait_ready(&self, timeout: Duration) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.raw_fd()?,
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        // SAFETY: one valid pollfd
        match unsafe { libc::poll(&mut pfd, 1, millis) } {
            -1 => Err(io::Error::last_os_error()),
            0 => Ok(false),
            _ => Ok(true),
        }
    }

    fn close(&self) -> io::Result<()> {
        let fd = self.fd.swap(CLOSED, Ordering::AcqRel);
        if fd == CLOSED {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        // SAFETY: `fd` was owned by this device and is closed exactly once
        if unsafe { libc::close(fd) } == -1 {
            return Err(io::Error::last_os_error());
        }
        debug!("Closed {}", self.path.display());
        Ok(())
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        let fd = self.fd.swap(CLOSED, Ordering::AcqRel);
        if fd != CLOSED {
            // SAFETY: still owned, nobody else closes it
            if unsafe { libc::close(fd) } == -1 {
                warn!("Closing {} on drop: {}", self.path.display(), io::Error::last_os_error());
            }
        }
    }
}

/// Interpret the outcome of `VIDIOC_DQBUF`.
///
/// On `EIO` the driver may or may not have handed a buffer back. It only did
/// if it wrote an index or raised the error flag.
fn dequeued(result: io::Result<()>, buf: &v4l2_buffer) -> io::Result<DequeuedBuffer> {
    let flagged = buf.flags & V4L2_BUF_FLAG_ERROR != 0;
    let state = match result {
        Ok(()) if flagged => BufferState::Error,
        Ok(()) => BufferState::Filled,
        Err(e) if e.raw_os_error() == Some(libc::EIO) && (buf.index != NO_INDEX || flagged) => {
            BufferState::Error
        }
        Err(e) => return Err(e),
    };
    Ok(DequeuedBuffer {
        index: buf.index,
        bytes_used: buf.bytesused,
        sequence: buf.sequence,
        state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_device() {
        let err = V4l2Device::open("/nonexistent/video99").unwrap_err();
        assert!(matches!(err, CaptureError::DeviceNotFound { .. }));
    }

    #[test]
    fn test_regular_file_is_rejected() {
        let path = std::env::temp_dir().join(format!("camview-not-a-device-{}", std::process::id()));
        fs::File::create(&path).unwrap().write_all(b"frame").unwrap();
        let err = V4l2Device::open(&path).unwrap_err();
        fs::remove_file(&path).unwrap();
        assert!(matches!(err, CaptureError::NotCharDevice(_)));
    }

    #[test]
    fn test_non_v4l2_char_device() {
        // /dev/null answers every ioctl with ENOTTY
        let device = V4l2Device::open("/dev/null").unwrap();
        let err = device.query_capabilities().unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOTTY));
        device.close().unwrap();
        assert_eq!(device.close().unwrap_err().raw_os_error(), Some(libc::EBADF));
        assert_eq!(device.stream_on().unwrap_err().raw_os_error(), Some(libc::EBADF));
    }

    fn eio() -> io::Result<()> {
        Err(io::Error::from_raw_os_error(libc::EIO))
    }

    #[test]
    fn test_eio_without_buffer_is_an_error() {
        let buf = V4l2Device::capture_buffer(NO_INDEX);
        let err = dequeued(eio(), &buf).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EIO));
    }

    #[test]
    fn test_eio_with_buffer_is_lenient() {
        let mut buf = V4l2Device::capture_buffer(NO_INDEX);
        buf.index = 2;
        buf.bytesused = 614_400;
        let result = dequeued(eio(), &buf).unwrap();
        assert_eq!(result.index, 2);
        assert_eq!(result.state, BufferState::Error);

        let mut buf = V4l2Device::capture_buffer(NO_INDEX);
        buf.flags = V4L2_BUF_FLAG_ERROR;
        assert_eq!(dequeued(eio(), &buf).unwrap().state, BufferState::Error);
    }

    #[test]
    fn test_error_flag_marks_filled_buffer() {
        let mut buf = V4l2Device::capture_buffer(NO_INDEX);
        buf.index = 0;
        assert_eq!(dequeued(Ok(()), &buf).unwrap().state, BufferState::Filled);
        buf.flags |= V4L2_BUF_FLAG_ERROR;
        assert_eq!(dequeued(Ok(()), &buf).unwrap().state, BufferState::Error);

        let err = dequeued(Err(io::Error::from_raw_os_error(libc::EAGAIN)), &buf).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EAGAIN));
    }
}
