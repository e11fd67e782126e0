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

//! Translation of winit input into viewer events

use camview_core::{DisplayEvent, FrameSize, Key};
use winit::event::{ElementState, WindowEvent};
use winit::keyboard::{Key as WinitKey, NamedKey};

/// Map a logical key to the viewer's bindings.
pub fn map_key(key: &WinitKey) -> Key {
    match key {
        WinitKey::Named(NamedKey::Escape) => Key::Escape,
        WinitKey::Character(text) => match text.as_str() {
            "q" | "Q" => Key::Quit,
            "r" | "R" => Key::Restore,
            _ => Key::Other,
        },
        _ => Key::Other,
    }
}

/// Viewer event for a window event, `None` for the ones it never looks at
pub fn map_window_event(event: &WindowEvent) -> Option<DisplayEvent> {
    match event {
        WindowEvent::CloseRequested | WindowEvent::Destroyed => Some(DisplayEvent::Quit),
        WindowEvent::Resized(size) => Some(DisplayEvent::Resized(FrameSize::new(size.width, size.height))),
        WindowEvent::KeyboardInput { event, .. } if event.state == ElementState::Pressed && !event.repeat => {
            Some(DisplayEvent::KeyPressed(map_key(&event.logical_key)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use winit::dpi::PhysicalSize;

    #[test]
    fn test_key_bindings() {
        assert_eq!(map_key(&WinitKey::Character("q".into())), Key::Quit);
        assert_eq!(map_key(&WinitKey::Character("Q".into())), Key::Quit);
        assert_eq!(map_key(&WinitKey::Character("r".into())), Key::Restore);
        assert_eq!(map_key(&WinitKey::Named(NamedKey::Escape)), Key::Escape);
        assert_eq!(map_key(&WinitKey::Character("x".into())), Key::Other);
        assert_eq!(map_key(&WinitKey::Named(NamedKey::Enter)), Key::Other);
    }

    #[test]
    fn test_window_events() {
        assert_eq!(map_window_event(&WindowEvent::CloseRequested), Some(DisplayEvent::Quit));
        assert_eq!(
            map_window_event(&WindowEvent::Resized(PhysicalSize::new(800, 600))),
            Some(DisplayEvent::Resized(FrameSize::new(800, 600)))
        );
        assert_eq!(map_window_event(&WindowEvent::Focused(true)), None);
    }
}
