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

//! Display pipeline and window event handling.

use crate::handoff::HandOffState;
use crate::session::CaptureSession;
use crate::worker::{Frame, FrameHandler, StopSignal};
use camview_core::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// How long the main loop idles between event drains
pub const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Draws published frames onto a [`RenderSurface`].
///
/// Runs on the capture worker. The row stride handed to the surface is
/// derived from the current logical width, so a resized window changes how
/// the same device bytes are laid out.
pub struct DisplayPipeline<S> {
    surface: S,
    state: Arc<HandOffState>,
    bytes_per_pixel: usize,
    last_pitch: Option<usize>,
}

impl<S: RenderSurface> DisplayPipeline<S> {
    pub fn new(surface: S, state: Arc<HandOffState>, fourcc: FourCc) -> Self {
        DisplayPipeline {
            surface,
            state,
            bytes_per_pixel: utils::bytes_per_pixel(fourcc).unwrap_or(2),
            last_pitch: None,
        }
    }

    /// Upload `pixels`, clear, draw the full logical area and present.
    pub fn render_frame(&mut self, pixels: &[u8]) -> CaptureResult<()> {
        let logical = self.state.logical_size();
        let pitch = logical.width as usize * self.bytes_per_pixel;

        self.surface.update_texture(pixels, pitch)?;
        self.surface.clear()?;
        self.surface.copy(Rect::at_origin(logical))?;
        self.surface.present()?;

        self.last_pitch = Some(pitch);
        Ok(())
    }

    /// Stride used by the most recent render
    pub fn last_pitch(&self) -> Option<usize> {
        self.last_pitch
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }
}

impl<S: RenderSurface> FrameHandler for DisplayPipeline<S> {
    fn handle_frame(&mut self, frame: Frame<'_>) -> CaptureResult<()> {
        self.render_frame(frame.data)
    }
}

/// Outcome of handling one display event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Continue,
    Quit,
}

/// Decides what a display event means for the session
pub trait EventHandler {
    fn handle_event(&mut self, event: DisplayEvent, source: &mut dyn EventSource) -> EventAction;
}

/// The viewer's key and window bindings
pub struct ViewerControls {
    state: Arc<HandOffState>,
}

impl ViewerControls {
    pub fn new(state: Arc<HandOffState>) -> Self {
        ViewerControls { state }
    }
}

impl EventHandler for ViewerControls {
    fn handle_event(&mut self, event: DisplayEvent, source: &mut dyn EventSource) -> EventAction {
        match event {
            DisplayEvent::Quit | DisplayEvent::KeyPressed(Key::Quit | Key::Escape) => EventAction::Quit,
            DisplayEvent::KeyPressed(Key::Restore) => {
                let size = self.state.restore();
                source.resize_window(size);
                debug!("Restored display size {}", size);
                EventAction::Continue
            }
            DisplayEvent::Resized(_) => {
                // the event payload may lag behind the window; re-read it
                let size = source.window_size();
                self.state.set_logical_size(size);
                debug!("Display resized to {}", size);
                EventAction::Continue
            }
            DisplayEvent::KeyPressed(Key::Other) | DisplayEvent::Other => EventAction::Continue,
        }
    }
}

/// Why the main loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Quit event from the window
    Quit,
    /// The capture worker returned on its own, normally with an error
    WorkerFinished,
    Interrupted,
}

/// An event source paired with the handler that interprets it
pub struct DisplayEvents<E, H> {
    source: E,
    handler: H,
}

impl<E: EventSource, H: EventHandler> DisplayEvents<E, H> {
    pub fn new(source: E, handler: H) -> Self {
        DisplayEvents { source, handler }
    }

    /// Drain pending events; `true` as soon as one asks to quit.
    pub fn poll_events(&mut self) -> bool {
        while let Some(event) = self.source.poll_event() {
            if self.handler.handle_event(event, &mut self.source) == EventAction::Quit {
                return true;
            }
        }
        false
    }

    /// Poll events until a quit request, an interrupt or the end of the worker.
    pub fn run(&mut self, session: &CaptureSession, interrupt: &StopSignal) -> ExitReason {
        let reason = loop {
            if self.poll_events() {
                break ExitReason::Quit;
            }
            if interrupt.is_stopped() {
                break ExitReason::Interrupted;
            }
            if session.worker_finished() {
                break ExitReason::WorkerFinished;
            }
            self.source.wait_for_events(EVENT_POLL_INTERVAL);
        };
        info!("Leaving event loop: {:?}", reason);
        reason
    }

    pub fn source(&self) -> &E {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut E {
        &mut self.source
    }

    pub fn into_source(self) -> E {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct RecordingSurface {
        pitches: Vec<usize>,
        copies: Vec<Rect>,
        ops: Vec<&'static str>,
    }

    impl RenderSurface for RecordingSurface {
        fn update_texture(&mut self, _pixels: &[u8], pitch: usize) -> CaptureResult<()> {
            self.pitches.push(pitch);
            self.ops.push("update");
            Ok(())
        }

        fn clear(&mut self) -> CaptureResult<()> {
            self.ops.push("clear");
            Ok(())
        }

        fn copy(&mut self, dst: Rect) -> CaptureResult<()> {
            self.copies.push(dst);
            self.ops.push("copy");
            Ok(())
        }

        fn present(&mut self) -> CaptureResult<()> {
            self.ops.push("present");
            Ok(())
        }
    }

    struct ScriptedEvents {
        pending: VecDeque<DisplayEvent>,
        size: FrameSize,
        resize_requests: Vec<FrameSize>,
    }

    impl ScriptedEvents {
        fn new(events: impl IntoIterator<Item = DisplayEvent>) -> Self {
            ScriptedEvents {
                pending: events.into_iter().collect(),
                size: FrameSize::vga(),
                resize_requests: Vec::new(),
            }
        }
    }

    impl EventSource for ScriptedEvents {
        fn poll_event(&mut self) -> Option<DisplayEvent> {
            let event = self.pending.pop_front()?;
            if let DisplayEvent::Resized(size) = event {
                self.size = size;
            }
            Some(event)
        }

        fn window_size(&self) -> FrameSize {
            self.size
        }

        fn resize_window(&mut self, size: FrameSize) {
            self.size = size;
            self.resize_requests.push(size);
        }
    }

    #[test]
    fn test_render_sequence() {
        let state = Arc::new(HandOffState::new(FrameSize::vga()));
        let mut pipeline = DisplayPipeline::new(RecordingSurface::default(), state, FourCc::YUYV);
        pipeline.render_frame(&[0u8; 64]).unwrap();
        pipeline.render_frame(&[0u8; 64]).unwrap();

        let surface = pipeline.surface();
        assert_eq!(
            surface.ops,
            ["update", "clear", "copy", "present", "update", "clear", "copy", "present"]
        );
        assert_eq!(surface.copies[0], Rect::at_origin(FrameSize::vga()));
    }

    #[test]
    fn test_stride_follows_logical_width() {
        let state = Arc::new(HandOffState::new(FrameSize::vga()));
        let mut pipeline = DisplayPipeline::new(RecordingSurface::default(), state.clone(), FourCc::YUYV);

        pipeline.render_frame(&[]).unwrap();
        assert_eq!(pipeline.last_pitch(), Some(1280));

        state.set_logical_size(FrameSize::new(800, 600));
        pipeline.render_frame(&[]).unwrap();
        assert_eq!(pipeline.last_pitch(), Some(1600));
        assert_eq!(pipeline.surface().copies[1], Rect::at_origin(FrameSize::new(800, 600)));
    }

    #[test]
    fn test_quit_keys_and_close() {
        for event in [
            DisplayEvent::Quit,
            DisplayEvent::KeyPressed(Key::Quit),
            DisplayEvent::KeyPressed(Key::Escape),
        ] {
            let state = Arc::new(HandOffState::new(FrameSize::vga()));
            let mut events = DisplayEvents::new(ScriptedEvents::new([event]), ViewerControls::new(state));
            assert!(events.poll_events(), "{:?} should quit", event);
        }
    }

    #[test]
    fn test_resize_then_restore() {
        let state = Arc::new(HandOffState::new(FrameSize::vga()));
        let source = ScriptedEvents::new([
            DisplayEvent::Resized(FrameSize::new(800, 600)),
            DisplayEvent::Resized(FrameSize::new(1024, 768)),
            DisplayEvent::KeyPressed(Key::Other),
            DisplayEvent::Other,
        ]);
        let mut events = DisplayEvents::new(source, ViewerControls::new(state.clone()));

        assert!(!events.poll_events());
        assert_eq!(state.logical_size(), FrameSize::new(1024, 768));

        events.source_mut().pending.push_back(DisplayEvent::KeyPressed(Key::Restore));
        assert!(!events.poll_events());
        assert_eq!(state.logical_size(), FrameSize::vga());
        assert_eq!(events.source().resize_requests, [FrameSize::vga()]);
        assert_eq!(events.source().window_size(), FrameSize::vga());
    }

    #[test]
    fn test_quit_stops_draining() {
        let state = Arc::new(HandOffState::new(FrameSize::vga()));
        let source = ScriptedEvents::new([
            DisplayEvent::Resized(FrameSize::new(800, 600)),
            DisplayEvent::Quit,
            DisplayEvent::Resized(FrameSize::new(320, 240)),
        ]);
        let mut events = DisplayEvents::new(source, ViewerControls::new(state.clone()));

        assert!(events.poll_events());
        assert_eq!(state.logical_size(), FrameSize::new(800, 600));
        assert_eq!(events.into_source().pending.len(), 1);
    }
}
