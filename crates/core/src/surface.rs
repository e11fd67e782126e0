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

//! Rendering and windowing collaborators

use crate::{CaptureResult, FrameSize};
use std::time::Duration;

/// Destination rectangle on the render target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn at_origin(size: FrameSize) -> Self {
        Rect {
            x: 0,
            y: 0,
            width: size.width,
            height: size.height,
        }
    }
}

/// Drawing primitives of a streaming-texture render target.
///
/// The texture keeps the device's raw pixel encoding; `update_texture`
/// receives the bytes of one frame and the row stride to read them with.
pub trait RenderSurface {
    fn update_texture(&mut self, pixels: &[u8], pitch: usize) -> CaptureResult<()>;
    fn clear(&mut self) -> CaptureResult<()>;
    fn copy(&mut self, dst: Rect) -> CaptureResult<()>;
    fn present(&mut self) -> CaptureResult<()>;
}

/// Keys the viewer reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    /// `q`
    Quit,
    Escape,
    /// `r`: back to the startup resolution
    Restore,
    Other,
}

/// Input and window events delivered by an [`EventSource`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayEvent {
    Quit,
    KeyPressed(Key),
    Resized(FrameSize),
    Other,
}

/// Window-side event queue
pub trait EventSource {
    /// Next pending event, `None` once the queue is drained.
    fn poll_event(&mut self) -> Option<DisplayEvent>;

    /// Current inner size of the window
    fn window_size(&self) -> FrameSize;

    fn resize_window(&mut self, size: FrameSize);

    /// Block until events may be pending or `timeout` elapses.
    fn wait_for_events(&mut self, timeout: Duration) {
        std::thread::sleep(timeout);
    }
}
