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

//! In-memory capture device.
//!
//! Behaves like a V4L2 streaming device: buffers are requested, queried and
//! mapped, queued buffers come back filled with a moving colour-bar pattern
//! at the configured frame rate, and the usual errno values are reported.
//! Dequeue outcomes, wait timeouts and interrupts can be scripted, and every
//! control call is recorded.

use camview_core::*;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Calls kept in the log; later calls are dropped.
const CALL_LOG_LIMIT: usize = 4096;

/// Pacing used until a frame interval is set
const DEFAULT_FRAME_PERIOD: Duration = Duration::from_millis(1);

/// Limited-range YUV of the eight classic colour bars
const BARS: [(u8, u8, u8); 8] = [
    (235, 128, 128),
    (210, 16, 146),
    (170, 166, 16),
    (145, 54, 34),
    (106, 202, 222),
    (81, 90, 240),
    (41, 240, 110),
    (16, 128, 128),
];

/// Scripted result of the next dequeue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueScript {
    /// `EAGAIN`
    Again,
    /// Dequeue normally but flag the buffer as errored (`EIO`)
    IoError,
    /// Fail with this errno
    Errno(i32),
    /// Report this slot index without touching the queue
    Index(u32),
}

/// Recorded device call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCall {
    QueryCap,
    SetFormat,
    GetFormat,
    SetParm,
    RequestBuffers(u32),
    QueryBuffer(u32),
    Map(u32),
    Unmap(u32),
    Queue(u32),
    Dequeue(u32),
    StreamOn,
    StreamOff,
    Close,
}

#[derive(Debug, Clone)]
pub struct SimulatedDeviceConfig {
    pub path: PathBuf,
    pub capabilities: u32,
    pub max_size: FrameSize,
    /// Count granted by `request_buffers`; `None` grants what was asked.
    pub granted_buffers: Option<u32>,
    pub mmap_supported: bool,
    /// Slot index whose mapping fails with `ENOMEM`
    pub fail_map_at: Option<u32>,
}

impl Default for SimulatedDeviceConfig {
    fn default() -> Self {
        SimulatedDeviceConfig {
            path: PathBuf::from("sim://camera0"),
            capabilities: Capabilities::VIDEO_CAPTURE | Capabilities::STREAMING,
            max_size: FrameSize::new(1920, 1080),
            granted_buffers: None,
            mmap_supported: true,
            fail_map_at: None,
        }
    }
}

struct Slot {
    memory: NonNull<u8>,
    length: usize,
    mapped: bool,
    queued: bool,
}

// SAFETY: slot memory is a heap allocation owned by the device state and only
// touched under its mutex or through the mapped region protocol.
unsafe impl Send for Slot {}

impl Slot {
    fn allocate(length: usize) -> Self {
        let memory: Box<[u8]> = vec![0u8; length].into_boxed_slice();
        let raw = Box::into_raw(memory) as *mut u8;
        Slot {
            // SAFETY: Box::into_raw never returns null
            memory: unsafe { NonNull::new_unchecked(raw) },
            length,
            mapped: false,
            queued: false,
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        // SAFETY: `memory` came from Box::into_raw of a boxed slice of `length` bytes
        unsafe {
            let slice = std::ptr::slice_from_raw_parts_mut(self.memory.as_ptr(), self.length);
            drop(Box::from_raw(slice));
        }
    }
}

struct SimState {
    format: CaptureFormat,
    interval: Option<FrameInterval>,
    slots: Vec<Slot>,
    incoming: VecDeque<u32>,
    streaming: bool,
    closed: bool,
    script: VecDeque<DequeueScript>,
    wait_timeouts: u32,
    wait_interrupts: u32,
    wait_errors: VecDeque<i32>,
    sequence: u32,
    next_frame: Instant,
    calls: Vec<DeviceCall>,
}

impl SimState {
    fn record(&mut self, call: DeviceCall) {
        if self.calls.len() < CALL_LOG_LIMIT {
            self.calls.push(call);
        }
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed {
            Err(errno(libc::EBADF))
        } else {
            Ok(())
        }
    }

    fn frame_period(&self) -> Duration {
        match self.interval {
            Some(FrameInterval { numerator, denominator }) if denominator > 0 => {
                Duration::from_secs(numerator as u64) / denominator
            }
            _ => DEFAULT_FRAME_PERIOD,
        }
    }

    fn take_filled(&mut self, state: BufferState) -> io::Result<DequeuedBuffer> {
        if !self.streaming {
            return Err(errno(libc::EINVAL));
        }
        let index = self.incoming.pop_front().ok_or_else(|| errno(libc::EAGAIN))?;
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);

        let format = self.format;
        let slot = &mut self.slots[index as usize];
        slot.queued = false;
        // SAFETY: the slot was queued, so no reader holds a view of it, and
        // the allocation is `length` bytes long.
        let memory = unsafe { std::slice::from_raw_parts_mut(slot.memory.as_ptr(), slot.length) };
        let used = paint_color_bars(memory, format, sequence);

        self.record(DeviceCall::Dequeue(index));
        Ok(DequeuedBuffer {
            index,
            bytes_used: used as u32,
            sequence,
            state,
        })
    }
}

/// Capture device backed by process memory
pub struct SimulatedDevice {
    path: PathBuf,
    config: SimulatedDeviceConfig,
    state: Mutex<SimState>,
}

impl SimulatedDevice {
    pub fn new(config: SimulatedDeviceConfig) -> Self {
        let format = packed_format(FrameSize::vga().clamp_to(config.max_size), FieldOrder::None);
        SimulatedDevice {
            path: config.path.clone(),
            config,
            state: Mutex::new(SimState {
                format,
                interval: None,
                slots: Vec::new(),
                incoming: VecDeque::new(),
                streaming: false,
                closed: false,
                script: VecDeque::new(),
                wait_timeouts: 0,
                wait_interrupts: 0,
                wait_errors: VecDeque::new(),
                sequence: 0,
                next_frame: Instant::now(),
                calls: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue outcomes for the next dequeues, consumed before normal behaviour.
    pub fn script_dequeue(&self, outcomes: impl IntoIterator<Item = DequeueScript>) {
        self.lock().script.extend(outcomes);
    }

    /// Make the next `count` waits time out.
    pub fn script_wait_timeouts(&self, count: u32) {
        self.lock().wait_timeouts += count;
    }

    /// Make the next `count` waits report `EINTR`.
    pub fn script_wait_interrupts(&self, count: u32) {
        self.lock().wait_interrupts += count;
    }

    /// Make the next wait fail with `code`, after any scripted interrupts.
    pub fn script_wait_errno(&self, code: i32) {
        self.lock().wait_errors.push_back(code);
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.lock().calls.clone()
    }

    pub fn mapped_count(&self) -> usize {
        self.lock().slots.iter().filter(|s| s.mapped).count()
    }

    pub fn queued_count(&self) -> usize {
        self.lock().incoming.len()
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().streaming
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn frame_interval(&self) -> Option<FrameInterval> {
        self.lock().interval
    }
}

impl CaptureDevice for SimulatedDevice {
    fn path(&self) -> &Path {
        &self.path
    }

    fn query_capabilities(&self) -> io::Result<Capabilities> {
        let mut state = self.lock();
        state.check_open()?;
        state.record(DeviceCall::QueryCap);
        Ok(Capabilities {
            driver: "camview-sim".to_string(),
            card: "Simulated Camera".to_string(),
            bus_info: "virtual".to_string(),
            version: 1,
            capabilities: self.config.capabilities,
        })
    }

    fn set_format(&self, format: &CaptureFormat) -> io::Result<CaptureFormat> {
        let mut state = self.lock();
        state.check_open()?;
        state.record(DeviceCall::SetFormat);
        if state.streaming || !state.slots.is_empty() {
            return Err(errno(libc::EBUSY));
        }

        let size = format.size.clamp_to(self.config.max_size);
        // only packed YUYV is produced, like a webcam substituting its native format
        let adjusted = packed_format(FrameSize::new(size.width.max(2) & !1, size.height.max(2)), format.field);
        state.format = adjusted;
        Ok(adjusted)
    }

    fn get_format(&self) -> io::Result<CaptureFormat> {
        let mut state = self.lock();
        state.check_open()?;
        state.record(DeviceCall::GetFormat);
        Ok(state.format)
    }

    fn set_frame_interval(&self, interval: FrameInterval) -> io::Result<()> {
        let mut state = self.lock();
        state.check_open()?;
        state.record(DeviceCall::SetParm);
        if interval.denominator == 0 {
            return Err(errno(libc::EINVAL));
        }
        state.interval = Some(interval);
        Ok(())
    }

    fn request_buffers(&self, count: u32) -> io::Result<u32> {
        let mut state = self.lock();
        state.check_open()?;
        state.record(DeviceCall::RequestBuffers(count));
        if !self.config.mmap_supported {
            return Err(errno(libc::EINVAL));
        }
        if state.streaming || state.slots.iter().any(|s| s.mapped) {
            return Err(errno(libc::EBUSY));
        }

        let granted = self.config.granted_buffers.unwrap_or(count).min(32);
        let length = state.format.size_image as usize;
        state.incoming.clear();
        state.slots = (0..granted).map(|_| Slot::allocate(length)).collect();
        Ok(granted)
    }

    fn query_buffer(&self, index: u32) -> io::Result<BufferInfo> {
        let mut state = self.lock();
        state.check_open()?;
        state.record(DeviceCall::QueryBuffer(index));
        let slot = state.slots.get(index as usize).ok_or_else(|| errno(libc::EINVAL))?;
        let length = slot.length as u32;
        Ok(BufferInfo {
            index,
            length,
            offset: index * page_align(length),
        })
    }

    fn map_buffer(&self, info: &BufferInfo) -> io::Result<MappedRegion> {
        let mut state = self.lock();
        state.check_open()?;
        if self.config.fail_map_at == Some(info.index) {
            return Err(errno(libc::ENOMEM));
        }
        let index = state
            .slots
            .iter()
            .enumerate()
            .position(|(i, s)| i as u32 * page_align(s.length as u32) == info.offset)
            .ok_or_else(|| errno(libc::EINVAL))?;
        state.record(DeviceCall::Map(index as u32));

        let slot = &mut state.slots[index];
        slot.mapped = true;
        // SAFETY: the allocation lives until the slots are reallocated, which
        // `request_buffers` refuses while any slot is mapped.
        Ok(unsafe { MappedRegion::from_raw_parts(slot.memory, slot.length) })
    }

    fn unmap_buffer(&self, region: MappedRegion) -> io::Result<()> {
        let mut state = self.lock();
        let index = state
            .slots
            .iter()
            .position(|s| s.mapped && s.memory.as_ptr() == region.start())
            .ok_or_else(|| errno(libc::EINVAL))?;
        state.record(DeviceCall::Unmap(index as u32));
        state.slots[index].mapped = false;
        Ok(())
    }

    fn queue_buffer(&self, index: u32) -> io::Result<()> {
        let mut state = self.lock();
        state.check_open()?;
        let slot = state.slots.get_mut(index as usize).ok_or_else(|| errno(libc::EINVAL))?;
        if slot.queued {
            return Err(errno(libc::EINVAL));
        }
        slot.queued = true;
        state.incoming.push_back(index);
        state.record(DeviceCall::Queue(index));
        Ok(())
    }

    fn dequeue_buffer(&self) -> io::Result<DequeuedBuffer> {
        let mut state = self.lock();
        state.check_open()?;
        match state.script.pop_front() {
            Some(DequeueScript::Again) => Err(errno(libc::EAGAIN)),
            Some(DequeueScript::Errno(code)) => Err(errno(code)),
            Some(DequeueScript::Index(index)) => Ok(DequeuedBuffer {
                index,
                bytes_used: 0,
                sequence: state.sequence,
                state: BufferState::Filled,
            }),
            Some(DequeueScript::IoError) => state.take_filled(BufferState::Error),
            None => state.take_filled(BufferState::Filled),
        }
    }

    fn stream_on(&self) -> io::Result<()> {
        let mut state = self.lock();
        state.check_open()?;
        state.record(DeviceCall::StreamOn);
        if state.slots.is_empty() {
            return Err(errno(libc::EINVAL));
        }
        state.streaming = true;
        state.next_frame = Instant::now();
        Ok(())
    }

    fn stream_off(&self) -> io::Result<()> {
        let mut state = self.lock();
        state.check_open()?;
        state.record(DeviceCall::StreamOff);
        state.streaming = false;
        state.incoming.clear();
        for slot in &mut state.slots {
            slot.queued = false;
        }
        Ok(())
    }

    fn wait_ready(&self, timeout: Duration) -> io::Result<bool> {
        let due = {
            let mut state = self.lock();
            state.check_open()?;
            if state.wait_interrupts > 0 {
                state.wait_interrupts -= 1;
                return Err(errno(libc::EINTR));
            }
            if let Some(code) = state.wait_errors.pop_front() {
                return Err(errno(code));
            }
            if state.wait_timeouts > 0 {
                state.wait_timeouts -= 1;
                None
            } else if !state.script.is_empty() {
                return Ok(true);
            } else if state.streaming && !state.incoming.is_empty() {
                let due = state.next_frame;
                state.next_frame = due.max(Instant::now()) + state.frame_period();
                Some(due)
            } else {
                None
            }
        };

        match due {
            Some(due) => {
                let wait = due.saturating_duration_since(Instant::now());
                if wait > timeout {
                    thread::sleep(timeout);
                    return Ok(false);
                }
                thread::sleep(wait);
                Ok(true)
            }
            None => {
                thread::sleep(timeout);
                Ok(false)
            }
        }
    }

    fn close(&self) -> io::Result<()> {
        let mut state = self.lock();
        state.check_open()?;
        state.record(DeviceCall::Close);
        state.closed = true;
        Ok(())
    }
}

fn packed_format(size: FrameSize, field: FieldOrder) -> CaptureFormat {
    CaptureFormat {
        size,
        fourcc: FourCc::YUYV,
        field,
        bytes_per_line: utils::row_stride(size.width, FourCc::YUYV) as u32,
        size_image: utils::frame_bytes(size, FourCc::YUYV) as u32,
    }
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

fn page_align(length: u32) -> u32 {
    const PAGE: u32 = 4096;
    length.div_ceil(PAGE) * PAGE
}

/// Fill `memory` with YUYV colour bars scrolled by `sequence`; returns bytes written.
fn paint_color_bars(memory: &mut [u8], format: CaptureFormat, sequence: u32) -> usize {
    let width = format.size.width as usize;
    let stride = format.bytes_per_line as usize;
    let rows = format.size.height as usize;
    let shift = (sequence as usize * 4) % width.max(1);

    for (y, row) in memory.chunks_mut(stride).take(rows).enumerate() {
        for (pair, px) in row[..width * 2].chunks_exact_mut(4).enumerate() {
            let x = (pair * 2 + shift) % width;
            let (luma, u, v) = BARS[x * BARS.len() / width];
            // darken the bottom strip so scrolling is visible
            let luma = if y >= rows * 7 / 8 { luma / 2 } else { luma };
            px.copy_from_slice(&[luma, u, luma, v]);
        }
    }
    (stride * rows).min(memory.len())
}
