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

//! Memory-mapped buffer pool

use camview_core::*;
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Smallest pool that still allows capturing into one buffer while another
/// is being displayed.
pub const MIN_BUFFERS: u32 = 2;

/// Kernel buffers of one device, mapped into process memory.
///
/// The pool size is the count granted by the driver and is fixed for the
/// pool's lifetime.
pub struct BufferPool {
    device: Arc<dyn CaptureDevice>,
    buffers: Vec<MappedRegion>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("device", &self.device.path())
            .field("buffers", &self.buffers.len())
            .finish()
    }
}

impl BufferPool {
    /// Request `requested` buffers and map every granted one.
    pub fn allocate(device: Arc<dyn CaptureDevice>, requested: u32) -> CaptureResult<Self> {
        let path = device.path().to_path_buf();
        let granted = device.request_buffers(requested).map_err(|e| {
            if e.raw_os_error() == Some(libc::EINVAL) {
                CaptureError::MmapUnsupported(path.clone())
            } else {
                CaptureError::ioctl("VIDIOC_REQBUFS", e)
            }
        })?;

        if granted < MIN_BUFFERS {
            return Err(CaptureError::InsufficientBuffers {
                device: path,
                granted,
            });
        }
        if granted != requested {
            debug!("Requested {} buffers, driver granted {}", requested, granted);
        }

        let mut pool = BufferPool {
            device,
            buffers: Vec::with_capacity(granted as usize),
        };

        for index in 0..granted {
            if let Err(e) = pool.map_slot(index) {
                if let Err(unmap_err) = pool.unmap_all() {
                    warn!("Unmapping after failed allocation: {}", unmap_err);
                }
                return Err(e);
            }
        }

        debug!("Mapped {} buffers of {} bytes", pool.len(), pool.buffers[0].len());
        Ok(pool)
    }

    fn map_slot(&mut self, index: u32) -> CaptureResult<()> {
        let info = self
            .device
            .query_buffer(index)
            .map_err(|e| CaptureError::ioctl("VIDIOC_QUERYBUF", e))?;
        let region = self.device.map_buffer(&info).map_err(CaptureError::Mmap)?;
        trace!("Buffer {} mapped at {:p}, {} bytes", index, region.start(), region.len());
        self.buffers.push(region);
        Ok(())
    }

    fn unmap_all(&mut self) -> CaptureResult<()> {
        for region in self.buffers.drain(..) {
            self.device.unmap_buffer(region).map_err(CaptureError::Munmap)?;
        }
        Ok(())
    }

    /// Unmap every buffer. Streaming must already be off.
    pub fn release(mut self) -> CaptureResult<()> {
        let count = self.buffers.len();
        self.unmap_all()?;
        debug!("Released {} buffers", count);
        Ok(())
    }

    /// Granted buffer count
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn regions(&self) -> &[MappedRegion] {
        &self.buffers
    }

    /// Hand slot `index` to the driver for filling.
    pub fn enqueue(&self, index: u32) -> CaptureResult<()> {
        if index as usize >= self.buffers.len() {
            return Err(CaptureError::BufferIndexOutOfRange {
                index,
                count: self.buffers.len(),
            });
        }
        self.device
            .queue_buffer(index)
            .map_err(|e| CaptureError::ioctl("VIDIOC_QBUF", e))?;
        trace!("Queued buffer {}", index);
        Ok(())
    }

    /// Take the next filled buffer from the driver.
    ///
    /// `Ok(None)` when no buffer is ready yet (`EAGAIN`). Buffers flagged as
    /// possibly corrupted are still returned.
    pub fn dequeue_next(&self) -> CaptureResult<Option<FilledSlot<'_>>> {
        let buffer = match self.device.dequeue_buffer() {
            Ok(buffer) => buffer,
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => {
                counter!("camview_dequeue_again_total").increment(1);
                return Ok(None);
            }
            Err(e) => return Err(CaptureError::ioctl("VIDIOC_DQBUF", e)),
        };

        if buffer.index as usize >= self.buffers.len() {
            return Err(CaptureError::BufferIndexOutOfRange {
                index: buffer.index,
                count: self.buffers.len(),
            });
        }
        if buffer.state == BufferState::Error {
            counter!("camview_dequeue_lenient_total").increment(1);
            warn!("Buffer {} dequeued with an I/O error, using it anyway", buffer.index);
        }
        trace!("Dequeued buffer {} (seq {})", buffer.index, buffer.sequence);

        Ok(Some(FilledSlot { pool: self, buffer }))
    }
}

/// A dequeued buffer, readable until [`FilledSlot::requeue`] gives it back.
#[derive(Debug)]
pub struct FilledSlot<'p> {
    pool: &'p BufferPool,
    buffer: DequeuedBuffer,
}

impl<'p> FilledSlot<'p> {
    pub fn descriptor(&self) -> &DequeuedBuffer {
        &self.buffer
    }

    pub fn index(&self) -> u32 {
        self.buffer.index
    }

    /// Frame bytes: `bytes_used` when the driver reports it, else the whole slot.
    pub fn data(&self) -> &[u8] {
        let region = &self.pool.buffers[self.buffer.index as usize];
        // SAFETY: the slot is dequeued, so the driver will not write to it
        // until `requeue` consumes `self`, which ends this borrow.
        let full = unsafe { region.as_slice() };
        match self.buffer.bytes_used as usize {
            0 => full,
            used => &full[..used.min(full.len())],
        }
    }

    /// Return the buffer to the driver's queue.
    pub fn requeue(self) -> CaptureResult<()> {
        self.pool.enqueue(self.buffer.index)
    }
}
