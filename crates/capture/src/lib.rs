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

//! # camview capture
//!
//! Device negotiation, the memory-mapped buffer pool, the capture worker and
//! the state it shares with the display side.
//!
//! The main thread owns a [`CaptureSession`]: it configures the device,
//! allocates the pool, turns streaming on and spawns the worker. The worker
//! waits for the device, dequeues a filled buffer, publishes it to the
//! [`HandOffState`], renders it through its [`FrameHandler`] and re-queues
//! it. The main thread meanwhile drains window events through
//! [`DisplayEvents`] until a quit request, then stops and joins the worker
//! and tears everything down in reverse order.

pub mod display;
pub mod handoff;
pub mod negotiate;
pub mod pool;
pub mod session;
pub mod sim;
pub mod worker;

pub use display::*;
pub use handoff::*;
pub use negotiate::*;
pub use pool::*;
pub use session::*;
pub use sim::*;
pub use worker::*;

pub use camview_core::*;
