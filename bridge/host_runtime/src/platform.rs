//! Builders for the platform messages the native side sends.

use crate::message::Message;
use crate::registry::MessageType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PointerEventType {
    Move = 0,
    Press = 1,
    Release = 2,
}

impl PointerEventType {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Move),
            1 => Some(Self::Press),
            2 => Some(Self::Release),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

fn display_message(kind: MessageType, window_id: i64, display_name: &str) -> Message {
    Message::new(kind.as_str())
        .with("window_id", window_id)
        .with("display_name", display_name)
}

pub fn pointer_event(
    window_id: i64,
    display_name: &str,
    event_type: PointerEventType,
    x: f64,
    y: f64,
    index: i32,
) -> Message {
    display_message(MessageType::DisplayOnPointerEvent, window_id, display_name)
        .with("type", event_type.code())
        .with("x", x)
        .with("y", y)
        .with("index", index)
}

/// `is_repeat` is only present on repeats, matching what the runtime expects.
pub fn key_event(
    window_id: i64,
    display_name: &str,
    syscode: i32,
    keycode: i32,
    is_press: bool,
    is_repeat: bool,
) -> Message {
    let mut message = display_message(MessageType::DisplayOnKeyEvent, window_id, display_name)
        .with("syscode", syscode)
        .with("keycode", keycode)
        .with("is_press", is_press);
    if is_repeat {
        message.set("is_repeat", true);
    }
    message
}

pub fn render_event(
    window_id: i64,
    display_name: &str,
    display_size: (i32, i32),
    viewport_size: (i32, i32),
) -> Message {
    display_message(MessageType::DisplayOnRender, window_id, display_name)
        .with("display_width", display_size.0)
        .with("display_height", display_size.1)
        .with("viewport_width", viewport_size.0)
        .with("viewport_height", viewport_size.1)
}

pub fn focus_gained(window_id: i64, display_name: &str) -> Message {
    display_message(MessageType::DisplayFocusGained, window_id, display_name)
}

pub fn application_on_launch(
    application_data_folder: &str,
    user_data_folder: &str,
    cache_folder: &str,
) -> Message {
    Message::new(MessageType::ApplicationOnLaunch.as_str())
        .with("application_data_folder", application_data_folder)
        .with("user_data_folder", user_data_folder)
        .with("cache_folder", cache_folder)
}

pub fn application_lifecycle(kind: MessageType) -> Message {
    Message::new(kind.as_str())
}
