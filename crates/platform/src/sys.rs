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

//! V4L2 userspace ABI: the structures and request numbers the capture
//! device uses.
//!
//! See: https://www.kernel.org/doc/html/latest/userspace-api/media/v4l/user-func.html

#![allow(non_camel_case_types)]

use libc::{c_ulong, c_void};
use std::mem::size_of;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

/// `_IOC(dir, 'V', nr, size)`
const fn vidioc(dir: u32, nr: u32, size: usize) -> c_ulong {
    ((dir << 30) | ((size as u32) << 16) | ((b'V' as u32) << 8) | nr) as c_ulong
}

pub const VIDIOC_QUERYCAP: c_ulong = vidioc(IOC_READ, 0, size_of::<v4l2_capability>());
pub const VIDIOC_G_FMT: c_ulong = vidioc(IOC_READ | IOC_WRITE, 4, size_of::<v4l2_format>());
pub const VIDIOC_S_FMT: c_ulong = vidioc(IOC_READ | IOC_WRITE, 5, size_of::<v4l2_format>());
pub const VIDIOC_REQBUFS: c_ulong = vidioc(IOC_READ | IOC_WRITE, 8, size_of::<v4l2_requestbuffers>());
pub const VIDIOC_QUERYBUF: c_ulong = vidioc(IOC_READ | IOC_WRITE, 9, size_of::<v4l2_buffer>());
pub const VIDIOC_QBUF: c_ulong = vidioc(IOC_READ | IOC_WRITE, 15, size_of::<v4l2_buffer>());
pub const VIDIOC_DQBUF: c_ulong = vidioc(IOC_READ | IOC_WRITE, 17, size_of::<v4l2_buffer>());
pub const VIDIOC_STREAMON: c_ulong = vidioc(IOC_WRITE, 18, size_of::<libc::c_int>());
pub const VIDIOC_STREAMOFF: c_ulong = vidioc(IOC_WRITE, 19, size_of::<libc::c_int>());
pub const VIDIOC_S_PARM: c_ulong = vidioc(IOC_READ | IOC_WRITE, 22, size_of::<v4l2_streamparm>());

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
pub const V4L2_MEMORY_MMAP: u32 = 1;

/// Buffer holds data the driver flagged as possibly corrupted
pub const V4L2_BUF_FLAG_ERROR: u32 = 0x0040;

/// Zeroed ABI structures are valid: integers, byte arrays, unions of those
/// and null pointers.
macro_rules! zeroed_default {
    ($($ty:ty),* $(,)?) => {
        $(impl Default for $ty {
            fn default() -> Self {
                // SAFETY: every field of this plain C struct accepts all-zero bits
                unsafe { std::mem::zeroed() }
            }
        })*
    };
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_capability {
    pub driver: [u8; 16],
    pub card: [u8; 32],
    pub bus_info: [u8; 32],
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
    pub reserved: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct v4l2_pix_format {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub bytesperline: u32,
    pub sizeimage: u32,
    pub colorspace: u32,
    pub priv_: u32,
    pub flags: u32,
    pub ycbcr_enc: u32,
    pub quantization: u32,
    pub xfer_func: u32,
}

/// `fmt` union of `v4l2_format`; the kernel's variants include pointers,
/// hence the 8-byte alignment.
#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_format_fmt {
    pub pix: v4l2_pix_format,
    pub raw_data: [u8; 200],
    _align: [u64; 25],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_format {
    pub type_: u32,
    pub fmt: v4l2_format_fmt,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_requestbuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_buffer_m {
    pub offset: u32,
    pub userptr: c_ulong,
    pub planes: *mut c_void,
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: libc::timeval,
    pub timecode: v4l2_timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: v4l2_buffer_m,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct v4l2_fract {
    pub numerator: u32,
    pub denominator: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct v4l2_captureparm {
    pub capability: u32,
    pub capturemode: u32,
    pub timeperframe: v4l2_fract,
    pub extendedmode: u32,
    pub readbuffers: u32,
    pub reserved: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_streamparm_parm {
    pub capture: v4l2_captureparm,
    pub raw_data: [u8; 200],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_streamparm {
    pub type_: u32,
    pub parm: v4l2_streamparm_parm,
}

zeroed_default!(
    v4l2_capability,
    v4l2_format,
    v4l2_requestbuffers,
    v4l2_buffer,
    v4l2_streamparm,
);

/// NUL-terminated byte field as a string
pub fn c_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
