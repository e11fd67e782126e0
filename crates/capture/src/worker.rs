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

//! Capture worker: wait, dequeue, publish, render, re-queue.

use crate::handoff::HandOffState;
use crate::pool::BufferPool;
use camview_core::*;
use metrics::counter;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// How long the worker waits for a frame before giving up on the stream
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// One-shot cancellation flag shared by a session and its worker
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A filled frame, borrowed from the pool until its buffer is re-queued
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub index: u32,
    pub sequence: u32,
    pub state: BufferState,
    pub data: &'a [u8],
}

/// Consumer of freshly filled frames, run on the capture worker
pub trait FrameHandler {
    fn handle_frame(&mut self, frame: Frame<'_>) -> CaptureResult<()>;
}

impl<F> FrameHandler for F
where
    F: FnMut(Frame<'_>) -> CaptureResult<()>,
{
    fn handle_frame(&mut self, frame: Frame<'_>) -> CaptureResult<()> {
        self(frame)
    }
}

/// Counters reported when the worker exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub frames: u64,
    /// Dequeues that found no buffer ready
    pub retries: u64,
    /// Frames accepted despite an I/O error
    pub lenient: u64,
    pub interrupted_waits: u64,
}

/// The dequeue/consume/re-queue loop over one streaming pool
pub struct CaptureLoop {
    device: Arc<dyn CaptureDevice>,
    pool: Arc<BufferPool>,
    handoff: Arc<HandOffState>,
    stop: StopSignal,
    timeout: Duration,
}

impl CaptureLoop {
    pub fn new(
        device: Arc<dyn CaptureDevice>,
        pool: Arc<BufferPool>,
        handoff: Arc<HandOffState>,
        stop: StopSignal,
    ) -> Self {
        CaptureLoop {
            device,
            pool,
            handoff,
            stop,
            timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run until the stop signal is raised or a fatal error occurs.
    pub fn run<H: FrameHandler + ?Sized>(&self, handler: &mut H) -> CaptureResult<LoopStats> {
        let mut stats = LoopStats::default();

        while !self.stop.is_stopped() {
            match self.device.wait_ready(self.timeout) {
                Ok(true) => {}
                Ok(false) if self.stop.is_stopped() => break,
                Ok(false) => {
                    error!("No frame from {} within {:?}", self.device.path().display(), self.timeout);
                    return Err(CaptureError::Timeout(self.timeout));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    stats.interrupted_waits += 1;
                    continue;
                }
                Err(e) => return Err(CaptureError::Wait(e)),
            }

            let Some(slot) = self.pool.dequeue_next()? else {
                stats.retries += 1;
                continue;
            };

            let descriptor = *slot.descriptor();
            if descriptor.state == BufferState::Error {
                stats.lenient += 1;
            }

            let data = slot.data();
            self.handoff.publish(data);
            handler.handle_frame(Frame {
                index: descriptor.index,
                sequence: descriptor.sequence,
                state: descriptor.state,
                data,
            })?;

            slot.requeue()?;
            stats.frames += 1;
            counter!("camview_frames_captured_total").increment(1);
        }

        Ok(stats)
    }

    /// Start the loop on a dedicated thread.
    ///
    /// `make_handler` runs on the new thread, so handlers owning
    /// thread-bound resources (render surfaces) are created where they are
    /// used.
    pub fn spawn<F, H>(self, make_handler: F) -> CaptureResult<CaptureWorker>
    where
        F: FnOnce() -> CaptureResult<H> + Send + 'static,
        H: FrameHandler + 'static,
    {
        let handle = thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                let started = Instant::now();
                let mut handler = make_handler()?;
                debug!("Capture worker running");
                let stats = self.run(&mut handler)?;
                info!(
                    "Capture worker stopped after {}: {} frames ({:.1} fps), {} retries, {} with errors",
                    utils::format_duration(started.elapsed()),
                    stats.frames,
                    utils::average_fps(stats.frames, started.elapsed()),
                    stats.retries,
                    stats.lenient
                );
                Ok(stats)
            })
            .map_err(CaptureError::Spawn)?;

        Ok(CaptureWorker { handle })
    }
}

/// Handle to a running capture worker
#[derive(Debug)]
pub struct CaptureWorker {
    handle: JoinHandle<CaptureResult<LoopStats>>,
}

impl CaptureWorker {
    /// Whether the loop has returned, by stop request or by error
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> CaptureResult<LoopStats> {
        self.handle.join().map_err(|_| CaptureError::WorkerPanicked)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{DequeueScript, SimulatedDevice, SimulatedDeviceConfig};

    fn streaming(config: SimulatedDeviceConfig) -> (Arc<SimulatedDevice>, Arc<BufferPool>) {
        let device = Arc::new(SimulatedDevice::new(config));
        let pool = BufferPool::allocate(device.clone(), 4).unwrap();
        for i in 0..pool.len() as u32 {
            pool.enqueue(i).unwrap();
        }
        device.stream_on().unwrap();
        (device, Arc::new(pool))
    }

    #[test]
    fn test_try_again_leaves_pixels_untouched() {
        let (device, pool) = streaming(SimulatedDeviceConfig::default());
        device.script_dequeue([DequeueScript::Again, DequeueScript::Errno(libc::ENODEV)]);
        let handoff = Arc::new(HandOffState::new(FrameSize::vga()));
        let previous = vec![0xAAu8; 16];
        handoff.publish(&previous);
        let capture = CaptureLoop::new(device, pool, handoff.clone(), StopSignal::new());

        let mut renders = 0;
        let result = capture.run(&mut |_frame: Frame<'_>| {
            renders += 1;
            Ok(())
        });

        assert!(matches!(result, Err(CaptureError::Ioctl { request: "VIDIOC_DQBUF", .. })));
        assert_eq!(renders, 0);
        assert_eq!(handoff.published(), (previous.as_ptr(), previous.len()));
    }

    #[test]
    fn test_retry_then_frame() {
        let (device, pool) = streaming(SimulatedDeviceConfig::default());
        device.script_dequeue([DequeueScript::Again]);
        let handoff = Arc::new(HandOffState::new(FrameSize::vga()));
        let stop = StopSignal::new();
        let capture = CaptureLoop::new(device, pool, handoff.clone(), stop.clone());

        let stats = capture
            .run(&mut |frame: Frame<'_>| {
                assert_eq!(frame.index, 0);
                stop.stop();
                Ok(())
            })
            .unwrap();

        assert_eq!(stats.retries, 1);
        assert_eq!(stats.frames, 1);
        assert!(!handoff.published().0.is_null());
    }

    #[test]
    fn test_timeout_is_fatal() {
        let (device, pool) = streaming(SimulatedDeviceConfig::default());
        device.script_wait_timeouts(1);
        let handoff = Arc::new(HandOffState::new(FrameSize::vga()));
        let capture = CaptureLoop::new(device, pool, handoff.clone(), StopSignal::new())
            .with_timeout(Duration::from_millis(20));

        let result = capture.run(&mut |_frame: Frame<'_>| Ok(()));
        assert!(matches!(result, Err(CaptureError::Timeout(_))));
        assert!(handoff.published().0.is_null());
    }

    #[test]
    fn test_interrupted_wait_is_retried() {
        let (device, pool) = streaming(SimulatedDeviceConfig::default());
        device.script_wait_interrupts(3);
        let handoff = Arc::new(HandOffState::new(FrameSize::vga()));
        let stop = StopSignal::new();
        let capture = CaptureLoop::new(device, pool, handoff, stop.clone());

        let stats = capture
            .run(&mut |_frame: Frame<'_>| {
                stop.stop();
                Ok(())
            })
            .unwrap();
        assert_eq!(stats.interrupted_waits, 3);
        assert_eq!(stats.frames, 1);
    }

    #[test]
    fn test_handler_error_stops_loop() {
        let (device, pool) = streaming(SimulatedDeviceConfig::default());
        let handoff = Arc::new(HandOffState::new(FrameSize::vga()));
        let capture = CaptureLoop::new(device, pool, handoff, StopSignal::new());

        let result = capture.run(&mut |_frame: Frame<'_>| Err(CaptureError::Display("lost surface".to_string())));
        assert!(matches!(result, Err(CaptureError::Display(_))));
    }

    #[test]
    fn test_frames_carry_slot_indices_in_range() {
        let (device, pool) = streaming(SimulatedDeviceConfig::default());
        let handoff = Arc::new(HandOffState::new(FrameSize::vga()));
        let stop = StopSignal::new();
        let count = pool.len() as u32;
        let capture = CaptureLoop::new(device, pool, handoff, stop.clone());

        let mut seen = Vec::new();
        capture
            .run(&mut |frame: Frame<'_>| {
                assert!(frame.index < count);
                assert_eq!(frame.data.len(), 640 * 480 * 2);
                seen.push(frame.index);
                if seen.len() == 12 {
                    stop.stop();
                }
                Ok(())
            })
            .unwrap();
        // slots come back in FIFO order, so every slot gets reused
        assert_eq!(&seen[..8], &[0, 1, 2, 3, 0, 1, 2, 3]);
    }

    #[test]
    fn test_wait_error_is_fatal() {
        let (device, pool) = streaming(SimulatedDeviceConfig::default());
        device.script_wait_interrupts(1);
        device.script_wait_errno(libc::EBADF);
        let handoff = Arc::new(HandOffState::new(FrameSize::vga()));
        let capture = CaptureLoop::new(device, pool, handoff.clone(), StopSignal::new());

        let mut renders = 0;
        let result = capture.run(&mut |_frame: Frame<'_>| {
            renders += 1;
            Ok(())
        });

        match result {
            Err(CaptureError::Wait(e)) => assert_eq!(e.raw_os_error(), Some(libc::EBADF)),
            other => panic!("expected wait error, got {other:?}"),
        }
        assert_eq!(renders, 0);
        assert!(handoff.published().0.is_null());
    }

    #[test]
    fn test_out_of_range_slot_stops_loop() {
        let (device, pool) = streaming(SimulatedDeviceConfig::default());
        device.script_dequeue([DequeueScript::Index(7)]);
        let handoff = Arc::new(HandOffState::new(FrameSize::vga()));
        let capture = CaptureLoop::new(device, pool, handoff.clone(), StopSignal::new());

        let mut renders = 0;
        let result = capture.run(&mut |_frame: Frame<'_>| {
            renders += 1;
            Ok(())
        });

        assert!(matches!(result, Err(CaptureError::BufferIndexOutOfRange { index: 7, count: 4 })));
        assert_eq!(renders, 0);
        assert!(handoff.published().0.is_null());
    }

    #[test]
    fn test_published_record_matches_rendered_frame() {
        let (device, pool) = streaming(SimulatedDeviceConfig::default());
        let handoff = Arc::new(HandOffState::new(FrameSize::vga()));
        let stop = StopSignal::new();
        let capture = CaptureLoop::new(device, pool, handoff.clone(), stop.clone());

        capture
            .run(&mut |frame: Frame<'_>| {
                assert_eq!(handoff.published(), (frame.data.as_ptr(), frame.data.len()));
                stop.stop();
                Ok(())
            })
            .unwrap();
    }
}
