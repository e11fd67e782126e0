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

//! Window backend: a winit window pumped from the main thread and a
//! softbuffer presenter driven by the capture worker.

use crate::input::map_window_event;
use camview_core::*;
use softbuffer::{Context, Surface};
use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};
use winit::window::{Window, WindowId};

/// Pumps allowed for the window to appear
const CREATE_ATTEMPTS: usize = 200;
const CREATE_PUMP_TIMEOUT: Duration = Duration::from_millis(10);

fn display_error(context: &str, err: impl std::fmt::Display) -> CaptureError {
    CaptureError::Display(format!("{context}: {err}"))
}

struct WindowApp {
    title: String,
    size: FrameSize,
    window: Option<Arc<Window>>,
    error: Option<String>,
    pending: VecDeque<DisplayEvent>,
}

impl ApplicationHandler for WindowApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let attributes = Window::default_attributes()
            .with_title(self.title.as_str())
            .with_inner_size(PhysicalSize::new(self.size.width, self.size.height))
            .with_resizable(true);

        match event_loop.create_window(attributes) {
            Ok(window) => self.window = Some(Arc::new(window)),
            Err(e) => {
                self.error = Some(e.to_string());
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        if let Some(event) = map_window_event(&event) {
            self.pending.push_back(event);
        }
    }
}

/// The viewer window and its event queue.
///
/// Lives on the main thread. Rendering goes through a
/// [`SoftbufferPresenter`] built from [`DisplaySurface::window`] on the
/// thread that draws.
pub struct DisplaySurface {
    window: Arc<Window>,
    app: WindowApp,
    event_loop: EventLoop<()>,
    exited: bool,
}

impl DisplaySurface {
    /// Open a resizable window of `size` physical pixels.
    pub fn create(title: &str, size: FrameSize) -> CaptureResult<Self> {
        let mut event_loop = EventLoop::new().map_err(|e| display_error("event loop", e))?;
        let mut app = WindowApp {
            title: title.to_string(),
            size,
            window: None,
            error: None,
            pending: VecDeque::new(),
        };

        for _ in 0..CREATE_ATTEMPTS {
            let status = event_loop.pump_app_events(Some(CREATE_PUMP_TIMEOUT), &mut app);
            if app.window.is_some() || app.error.is_some() || matches!(status, PumpStatus::Exit(_)) {
                break;
            }
        }

        if let Some(err) = app.error.take() {
            return Err(display_error("window", err));
        }
        let window = app
            .window
            .clone()
            .ok_or_else(|| CaptureError::Display("window was not created".to_string()))?;

        info!("Created {} window \"{}\"", size, title);
        Ok(DisplaySurface {
            window,
            app,
            event_loop,
            exited: false,
        })
    }

    /// Shared handle for building a presenter
    pub fn window(&self) -> Arc<Window> {
        self.window.clone()
    }

    /// Close the window. Presenters must be gone by now.
    pub fn destroy(self) {
        debug!("Destroying window");
        drop(self);
    }

    fn pump(&mut self, timeout: Duration) {
        if self.exited {
            return;
        }
        if let PumpStatus::Exit(_) = self.event_loop.pump_app_events(Some(timeout), &mut self.app) {
            self.exited = true;
            self.app.pending.push_back(DisplayEvent::Quit);
        }
    }
}

impl EventSource for DisplaySurface {
    fn poll_event(&mut self) -> Option<DisplayEvent> {
        if self.app.pending.is_empty() {
            self.pump(Duration::ZERO);
        }
        self.app.pending.pop_front()
    }

    fn window_size(&self) -> FrameSize {
        let size = self.window.inner_size();
        FrameSize::new(size.width, size.height)
    }

    fn resize_window(&mut self, size: FrameSize) {
        // some platforms apply the size asynchronously and report a Resized later
        let _ = self
            .window
            .request_inner_size(PhysicalSize::new(size.width, size.height));
    }

    fn wait_for_events(&mut self, timeout: Duration) {
        self.pump(timeout);
    }
}

/// Packed 4:2:2 byte orders the presenter can show
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PackedYuv {
    Yuyv,
    Uyvy,
}

impl PackedYuv {
    fn for_fourcc(fourcc: FourCc) -> Option<Self> {
        match fourcc {
            FourCc::YUYV => Some(PackedYuv::Yuyv),
            FourCc::UYVY => Some(PackedYuv::Uyvy),
            _ => None,
        }
    }
}

/// Software renderer with a streaming texture of the capture size.
///
/// `update_texture` converts the raw device bytes into the 0RGB texture,
/// `copy` sets the destination rectangle and `present` scales the texture
/// into it and puts it on screen.
pub struct SoftbufferPresenter {
    texture: Vec<u32>,
    texture_size: FrameSize,
    layout: PackedYuv,
    target: Rect,
    clear_pending: bool,
    surface: Surface<Arc<Window>, Arc<Window>>,
    _context: Context<Arc<Window>>,
    window: Arc<Window>,
}

impl SoftbufferPresenter {
    pub fn new(window: Arc<Window>, texture_size: FrameSize, fourcc: FourCc) -> CaptureResult<Self> {
        let layout = PackedYuv::for_fourcc(fourcc)
            .ok_or_else(|| CaptureError::Display(format!("cannot present {} frames", fourcc)))?;
        let context = Context::new(window.clone()).map_err(|e| display_error("softbuffer context", e))?;
        let surface = Surface::new(&context, window.clone()).map_err(|e| display_error("softbuffer surface", e))?;

        debug!("Presenter ready with {} {} texture", texture_size, fourcc);
        Ok(SoftbufferPresenter {
            texture: vec![0; texture_size.width as usize * texture_size.height as usize],
            texture_size,
            layout,
            target: Rect::at_origin(texture_size),
            clear_pending: true,
            surface,
            _context: context,
            window,
        })
    }
}

impl RenderSurface for SoftbufferPresenter {
    fn update_texture(&mut self, pixels: &[u8], pitch: usize) -> CaptureResult<()> {
        unpack_422(pixels, pitch, self.texture_size, self.layout, &mut self.texture);
        Ok(())
    }

    fn clear(&mut self) -> CaptureResult<()> {
        self.clear_pending = true;
        Ok(())
    }

    fn copy(&mut self, dst: Rect) -> CaptureResult<()> {
        self.target = dst;
        Ok(())
    }

    fn present(&mut self) -> CaptureResult<()> {
        let size = self.window.inner_size();
        let (Some(width), Some(height)) = (NonZeroU32::new(size.width), NonZeroU32::new(size.height)) else {
            return Ok(());
        };
        self.surface
            .resize(width, height)
            .map_err(|e| display_error("surface resize", e))?;

        let mut buffer = self.surface.buffer_mut().map_err(|e| display_error("surface buffer", e))?;
        if self.clear_pending {
            buffer.fill(0);
            self.clear_pending = false;
        }
        blit_scaled(
            &self.texture,
            self.texture_size,
            &mut buffer,
            FrameSize::new(size.width, size.height),
            self.target,
        );
        buffer.present().map_err(|e| display_error("present", e))
    }
}

fn yuv_to_xrgb(y: u8, u: u8, v: u8) -> u32 {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let r = ((298 * c + 409 * e + 128) >> 8).clamp(0, 255) as u32;
    let g = ((298 * c - 100 * d - 208 * e + 128) >> 8).clamp(0, 255) as u32;
    let b = ((298 * c + 516 * d + 128) >> 8).clamp(0, 255) as u32;
    (r << 16) | (g << 8) | b
}

/// Convert packed 4:2:2 rows read with `pitch` into the texture.
///
/// Rows past the end of `pixels` keep their previous contents.
fn unpack_422(pixels: &[u8], pitch: usize, size: FrameSize, layout: PackedYuv, texture: &mut [u32]) {
    let width = size.width as usize;
    if pitch == 0 || width == 0 {
        return;
    }

    for (row, out) in texture.chunks_exact_mut(width).take(size.height as usize).enumerate() {
        let start = row * pitch;
        if start >= pixels.len() {
            break;
        }
        let end = (start + width * 2).min(pixels.len());
        for (quad, px) in pixels[start..end].chunks_exact(4).zip(out.chunks_exact_mut(2)) {
            let (y0, u, y1, v) = match layout {
                PackedYuv::Yuyv => (quad[0], quad[1], quad[2], quad[3]),
                PackedYuv::Uyvy => (quad[1], quad[0], quad[3], quad[2]),
            };
            px[0] = yuv_to_xrgb(y0, u, v);
            px[1] = yuv_to_xrgb(y1, u, v);
        }
    }
}

/// Nearest-neighbour scale of `src` into `target`, clipped to `dst`.
fn blit_scaled(src: &[u32], src_size: FrameSize, dst: &mut [u32], dst_size: FrameSize, target: Rect) {
    let (src_w, src_h) = (src_size.width as usize, src_size.height as usize);
    let (dst_w, dst_h) = (dst_size.width as i64, dst_size.height as i64);
    let (tw, th) = (target.width as usize, target.height as usize);
    if src_w == 0 || src_h == 0 || tw == 0 || th == 0 {
        return;
    }

    for ty in 0..th {
        let y = target.y as i64 + ty as i64;
        if y < 0 || y >= dst_h {
            continue;
        }
        let sy = ty * src_h / th;
        for tx in 0..tw {
            let x = target.x as i64 + tx as i64;
            if x < 0 || x >= dst_w {
                continue;
            }
            let sx = tx * src_w / tw;
            if let Some(&pixel) = src.get(sy * src_w + sx) {
                dst[(y * dst_w + x) as usize] = pixel;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limited_range_extremes() {
        assert_eq!(yuv_to_xrgb(235, 128, 128), 0x00ff_ffff);
        assert_eq!(yuv_to_xrgb(16, 128, 128), 0);
    }

    #[test]
    fn test_unpack_respects_pitch() {
        let size = FrameSize::new(2, 2);
        // row 0 white, padding, row 1 black
        let pixels = [235, 128, 235, 128, 9, 9, 9, 9, 16, 128, 16, 128];
        let mut texture = vec![7u32; 4];
        unpack_422(&pixels, 8, size, PackedYuv::Yuyv, &mut texture);
        assert_eq!(texture, [0x00ff_ffff, 0x00ff_ffff, 0, 0]);
    }

    #[test]
    fn test_unpack_short_buffer_keeps_rows() {
        let size = FrameSize::new(2, 3);
        let pixels = [235, 128, 235, 128];
        let mut texture = vec![7u32; 6];
        // a stride wider than the texture runs out of data early
        unpack_422(&pixels, 1600, size, PackedYuv::Yuyv, &mut texture);
        assert_eq!(texture, [0x00ff_ffff, 0x00ff_ffff, 7, 7, 7, 7]);
    }

    #[test]
    fn test_uyvy_order() {
        let size = FrameSize::new(2, 1);
        let mut texture = vec![0u32; 2];
        unpack_422(&[128, 235, 128, 16], 4, size, PackedYuv::Uyvy, &mut texture);
        assert_eq!(texture, [0x00ff_ffff, 0]);
    }

    #[test]
    fn test_blit_scales_and_clips() {
        let src = [1, 2, 3, 4];
        let mut dst = vec![0u32; 16];
        blit_scaled(&src, FrameSize::new(2, 2), &mut dst, FrameSize::new(4, 4), Rect::at_origin(FrameSize::new(4, 4)));
        assert_eq!(&dst[..4], &[1, 1, 2, 2]);
        assert_eq!(&dst[12..], &[3, 3, 4, 4]);

        let mut dst = vec![0u32; 4];
        blit_scaled(&src, FrameSize::new(2, 2), &mut dst, FrameSize::new(2, 2), Rect::at_origin(FrameSize::new(800, 600)));
        assert_eq!(dst, [1, 1, 1, 1]);
    }

    #[test]
    fn test_presentable_formats() {
        assert_eq!(PackedYuv::for_fourcc(FourCc::YUYV), Some(PackedYuv::Yuyv));
        assert_eq!(PackedYuv::for_fourcc(FourCc::MJPG), None);
    }
}
