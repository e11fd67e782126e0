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

//! # camview platform
//!
//! Linux implementations of the capture and display collaborators: the
//! V4L2 character device driven with raw ioctls, and a winit window with a
//! softbuffer presenter.

#[cfg(target_os = "linux")]
pub mod sys;
#[cfg(target_os = "linux")]
pub mod video;

pub mod display;
pub mod input;

#[cfg(target_os = "linux")]
pub use video::V4l2Device;

pub use display::{DisplaySurface, SoftbufferPresenter};
