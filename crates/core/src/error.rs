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

//! Error types for camview

use crate::IoMethod;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for capture operations
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Main error type for camview.
///
/// Every variant is fatal for the session; the binary decides what to do at
/// its top-level boundary.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Cannot identify '{}': {source}", .path.display())]
    DeviceNotFound {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} is no device", .0.display())]
    NotCharDevice(PathBuf),

    #[error("Cannot open '{}': {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} is no V4L2 device", .0.display())]
    NotV4l2Device(PathBuf),

    #[error("{} is no video capture device", .0.display())]
    NoVideoCapture(PathBuf),

    #[error("{} does not support streaming i/o", .0.display())]
    NoStreaming(PathBuf),

    #[error("{} does not support memory mapping", .0.display())]
    MmapUnsupported(PathBuf),

    #[error("Insufficient buffer memory on {}: {granted} buffer(s) granted", .device.display())]
    InsufficientBuffers { device: PathBuf, granted: u32 },

    #[error("{request} error: {source}")]
    Ioctl {
        request: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("mmap error: {0}")]
    Mmap(#[source] io::Error),

    #[error("munmap error: {0}")]
    Munmap(#[source] io::Error),

    #[error("close error: {0}")]
    Close(#[source] io::Error),

    #[error("select timeout: no frame within {0:?}")]
    Timeout(Duration),

    #[error("select error: {0}")]
    Wait(#[source] io::Error),

    #[error("dequeued buffer index {index} outside pool of {count}")]
    BufferIndexOutOfRange { index: u32, count: usize },

    #[error("Display error: {0}")]
    Display(String),

    #[error("Could not start capture worker: {0}")]
    Spawn(#[source] io::Error),

    #[error("Capture worker panicked")]
    WorkerPanicked,

    #[error("Unsupported I/O method: {0}")]
    UnsupportedIoMethod(IoMethod),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CaptureError {
    pub fn ioctl(request: &'static str, source: io::Error) -> Self {
        CaptureError::Ioctl { request, source }
    }

    /// Raw errno carried by the underlying OS error, if any
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            CaptureError::DeviceNotFound { source, .. }
            | CaptureError::Open { source, .. }
            | CaptureError::Ioctl { source, .. } => source.raw_os_error(),
            CaptureError::Mmap(e)
            | CaptureError::Munmap(e)
            | CaptureError::Close(e)
            | CaptureError::Wait(e)
            | CaptureError::Spawn(e)
            | CaptureError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}
