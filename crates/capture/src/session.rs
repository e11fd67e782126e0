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

//! Capture session: owns the device, the buffer pool and the worker.

use crate::handoff::HandOffState;
use crate::negotiate::FormatNegotiator;
use crate::pool::BufferPool;
use crate::worker::{CaptureLoop, CaptureWorker, FrameHandler, LoopStats, StopSignal, DEFAULT_WAIT_TIMEOUT};
use camview_core::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Setup and teardown of one streaming session.
///
/// Every pool and streaming transition happens here, on the owning thread,
/// before the worker is spawned or after it has been joined.
pub struct CaptureSession {
    device: Arc<dyn CaptureDevice>,
    format: Option<CaptureFormat>,
    handoff: Option<Arc<HandOffState>>,
    pool: Option<Arc<BufferPool>>,
    worker: Option<CaptureWorker>,
    stop: StopSignal,
    wait_timeout: Duration,
    streaming: bool,
    closed: bool,
}

impl CaptureSession {
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        CaptureSession {
            device,
            format: None,
            handoff: None,
            pool: None,
            worker: None,
            stop: StopSignal::new(),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            streaming: false,
            closed: false,
        }
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn device(&self) -> &Arc<dyn CaptureDevice> {
        &self.device
    }

    /// Check capabilities, negotiate the format and frame rate.
    ///
    /// Returns the format the driver settled on, which sizes the display.
    pub fn configure(&mut self, size: FrameSize, fourcc: FourCc, fps: u32) -> CaptureResult<CaptureFormat> {
        let negotiator = FormatNegotiator::new(self.device.as_ref());
        negotiator.query_capabilities()?;
        negotiator.set_format(size, fourcc)?;
        let format = negotiator.get_format()?;
        negotiator.set_frame_rate(fps)?;

        if format.size != size {
            info!("Driver adjusted {} to {}", size, format.size);
        }
        self.format = Some(format);
        self.handoff = Some(Arc::new(HandOffState::new(format.size)));
        Ok(format)
    }

    pub fn format(&self) -> Option<CaptureFormat> {
        self.format
    }

    /// State shared with the display, available once configured
    pub fn handoff(&self) -> Option<Arc<HandOffState>> {
        self.handoff.clone()
    }

    /// Request and map `count` buffers; returns the granted count.
    pub fn allocate(&mut self, count: u32) -> CaptureResult<usize> {
        if self.pool.is_some() {
            return Err(CaptureError::Config("buffers already allocated".to_string()));
        }
        let pool = BufferPool::allocate(self.device.clone(), count)?;
        let granted = pool.len();
        self.pool = Some(Arc::new(pool));
        Ok(granted)
    }

    /// Queue every slot once, then turn streaming on.
    pub fn start_streaming(&mut self) -> CaptureResult<()> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| CaptureError::Config("no buffers allocated".to_string()))?;
        for index in 0..pool.len() as u32 {
            pool.enqueue(index)?;
        }
        self.device
            .stream_on()
            .map_err(|e| CaptureError::ioctl("VIDIOC_STREAMON", e))?;
        self.streaming = true;
        info!("Streaming {} buffers from {}", pool.len(), self.device.path().display());
        Ok(())
    }

    /// Start the capture worker; `make_handler` runs on the worker thread.
    pub fn spawn<F, H>(&mut self, make_handler: F) -> CaptureResult<()>
    where
        F: FnOnce() -> CaptureResult<H> + Send + 'static,
        H: FrameHandler + 'static,
    {
        if !self.streaming {
            return Err(CaptureError::Config("streaming is not on".to_string()));
        }
        if self.worker.is_some() {
            return Err(CaptureError::Config("capture worker already running".to_string()));
        }
        let (Some(pool), Some(handoff)) = (self.pool.clone(), self.handoff.clone()) else {
            return Err(CaptureError::Config("session is not configured".to_string()));
        };

        let capture = CaptureLoop::new(self.device.clone(), pool, handoff, self.stop.clone())
            .with_timeout(self.wait_timeout);
        self.worker = Some(capture.spawn(make_handler)?);
        Ok(())
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Whether a spawned worker has already returned
    pub fn worker_finished(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| w.is_finished())
    }

    /// Stop and join the worker, then stream off, unmap and close.
    ///
    /// Every step runs even after an earlier one failed; the first error is
    /// returned. A worker that ended with an error reports that error.
    pub fn shutdown(&mut self) -> CaptureResult<Option<LoopStats>> {
        if self.closed {
            return Ok(None);
        }
        self.closed = true;
        self.stop.stop();

        let mut first_error = None;
        let mut stats = None;
        let mut note = |result: CaptureResult<()>| {
            if let Err(e) = result {
                warn!("Teardown step failed: {}", e);
                first_error.get_or_insert(e);
            }
        };

        if let Some(worker) = self.worker.take() {
            debug!("Joining capture worker");
            note(worker.join().map(|s| stats = Some(s)));
        }

        if self.streaming {
            self.streaming = false;
            note(
                self.device
                    .stream_off()
                    .map_err(|e| CaptureError::ioctl("VIDIOC_STREAMOFF", e)),
            );
        }

        if let Some(pool) = self.pool.take() {
            let released = match Arc::try_unwrap(pool) {
                Ok(pool) => pool.release(),
                Err(_) => Err(CaptureError::Config("buffer pool still in use".to_string())),
            };
            note(released);
        }

        note(self.device.close().map_err(CaptureError::Close));
        info!("Closed {}", self.device.path().display());

        match first_error {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.shutdown() {
                warn!("Capture session teardown on drop: {}", e);
            }
        }
    }
}
