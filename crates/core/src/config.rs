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

//! Viewer configuration management

use crate::{CaptureError, CaptureResult, FourCc, FrameSize, IoMethod};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Viewer configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub device: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub io_method: IoMethod,
    /// Requested kernel buffers; the driver may grant a different count.
    pub buffer_count: u32,
    pub pixel_format: String,
    pub wait_timeout_ms: u64,
    pub window_title: String,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        ViewerConfig {
            device: PathBuf::from("/dev/video0"),
            width: 640,
            height: 480,
            fps: 30,
            io_method: IoMethod::Mmap,
            buffer_count: 4,
            pixel_format: "YUYV".to_string(),
            wait_timeout_ms: 2000,
            window_title: "camview".to_string(),
        }
    }
}

impl ViewerConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> CaptureResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: ViewerConfig = serde_json::from_str(&content)?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> CaptureResult<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        debug!("Saved configuration to {}", path.display());
        Ok(())
    }

    /// Per-user config file location, e.g. `~/.config/camview/camview.json`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "camview", "camview")
            .map(|dirs| dirs.config_dir().join("camview.json"))
    }

    pub fn frame_size(&self) -> FrameSize {
        FrameSize::new(self.width, self.height)
    }

    pub fn fourcc(&self) -> CaptureResult<FourCc> {
        self.pixel_format.parse()
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn validate(&self) -> CaptureResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(CaptureError::Config(format!(
                "invalid resolution {}",
                self.frame_size()
            )));
        }
        if self.fps == 0 {
            return Err(CaptureError::Config("frame rate must be positive".to_string()));
        }
        if self.buffer_count < 2 {
            return Err(CaptureError::Config(format!(
                "at least 2 buffers are needed, {} requested",
                self.buffer_count
            )));
        }
        if self.wait_timeout_ms == 0 {
            return Err(CaptureError::Config("wait timeout must be positive".to_string()));
        }
        self.fourcc()?;
        if self.io_method != IoMethod::Mmap {
            return Err(CaptureError::UnsupportedIoMethod(self.io_method));
        }
        Ok(())
    }
}
