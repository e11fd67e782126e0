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

//! State shared between the capture worker and the event side.

use camview_core::FrameSize;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

/// Pixel pointer and display dimensions shared by both threads.
///
/// The pixel pointer is written and read only by the capture worker. The
/// logical size is written by the event side on resize/restore and read by
/// the worker on every render, so both halves live in one atomic word and a
/// reader never sees a width from one update and a height from another.
#[derive(Debug)]
pub struct HandOffState {
    pixels: AtomicPtr<u8>,
    pixels_len: AtomicUsize,
    logical: AtomicU64,
    restore: FrameSize,
}

impl HandOffState {
    pub fn new(size: FrameSize) -> Self {
        HandOffState {
            pixels: AtomicPtr::new(ptr::null_mut()),
            pixels_len: AtomicUsize::new(0),
            logical: AtomicU64::new(size.pack()),
            restore: size,
        }
    }

    /// Currently displayed size
    pub fn logical_size(&self) -> FrameSize {
        FrameSize::unpack(self.logical.load(Ordering::Acquire))
    }

    pub fn set_logical_size(&self, size: FrameSize) {
        self.logical.store(size.pack(), Ordering::Release);
    }

    /// Size the display was created with
    pub fn restore_size(&self) -> FrameSize {
        self.restore
    }

    /// Reset the logical size to the creation size and return it.
    pub fn restore(&self) -> FrameSize {
        self.set_logical_size(self.restore);
        self.restore
    }

    /// Point the display at a freshly dequeued frame.
    pub fn publish(&self, frame: &[u8]) {
        self.pixels.store(frame.as_ptr() as *mut u8, Ordering::Relaxed);
        self.pixels_len.store(frame.len(), Ordering::Relaxed);
    }

    /// Address and length of the last published frame; null before the first.
    ///
    /// The address is only meaningful between the dequeue that published it
    /// and the following re-queue. Rendering takes the borrowed [`Frame`]
    /// instead; this record is for inspection, e.g. checking which slot the
    /// display last showed.
    ///
    /// [`Frame`]: crate::worker::Frame
    pub fn published(&self) -> (*const u8, usize) {
        (
            self.pixels.load(Ordering::Relaxed) as *const u8,
            self.pixels_len.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_restore_after_many_resizes() {
        let state = HandOffState::new(FrameSize::new(640, 480));
        for i in 1..=10 {
            state.set_logical_size(FrameSize::new(640 + i * 10, 480 + i * 5));
        }
        assert_eq!(state.logical_size(), FrameSize::new(740, 530));
        assert_eq!(state.restore(), FrameSize::new(640, 480));
        assert_eq!(state.logical_size(), FrameSize::new(640, 480));
    }

    #[test]
    fn test_publish_records_frame_address() {
        let state = HandOffState::new(FrameSize::vga());
        assert!(state.published().0.is_null());

        let frame = vec![0u8; 32];
        state.publish(&frame);
        assert_eq!(state.published(), (frame.as_ptr(), 32));
    }

    #[test]
    fn test_logical_size_never_tears() {
        let state = Arc::new(HandOffState::new(FrameSize::new(1, 1)));
        let writer = {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                for i in 1..20_000u32 {
                    state.set_logical_size(FrameSize::new(i, i));
                }
            })
        };
        for _ in 0..20_000 {
            let size = state.logical_size();
            assert_eq!(size.width, size.height);
        }
        writer.join().unwrap();
    }
}
