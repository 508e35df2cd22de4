use crate::context::HandlerContext;
use crate::message::Message;
use std::collections::HashMap;
use std::fmt;

pub type Handler = Box<dyn FnMut(&mut HandlerContext<'_>, &Message) -> anyhow::Result<()> + Send>;

/// Dispatch key. Tags the bridge knows about get their own variant; every
/// other tag is carried as `Custom`. Parsing always yields the named variant
/// for a known tag, so `Custom("Display.on_render")` never occurs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    ApplicationOnLaunch,
    ApplicationOnStart,
    ApplicationOnStop,
    ApplicationOnSave,
    DisplayOnRender,
    DisplayOnPointerEvent,
    DisplayOnKeyEvent,
    DisplayFocusGained,
    Custom(String),
}

impl MessageType {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "Application.on_launch" => Self::ApplicationOnLaunch,
            "Application.on_start" => Self::ApplicationOnStart,
            "Application.on_stop" => Self::ApplicationOnStop,
            "Application.on_save" => Self::ApplicationOnSave,
            "Display.on_render" => Self::DisplayOnRender,
            "Display.on_pointer_event" => Self::DisplayOnPointerEvent,
            "Display.on_key_event" => Self::DisplayOnKeyEvent,
            "Display.focus_gained" => Self::DisplayFocusGained,
            other => Self::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::ApplicationOnLaunch => "Application.on_launch",
            Self::ApplicationOnStart => "Application.on_start",
            Self::ApplicationOnStop => "Application.on_stop",
            Self::ApplicationOnSave => "Application.on_save",
            Self::DisplayOnRender => "Display.on_render",
            Self::DisplayOnPointerEvent => "Display.on_pointer_event",
            Self::DisplayOnKeyEvent => "Display.on_key_event",
            Self::DisplayFocusGained => "Display.focus_gained",
            Self::Custom(tag) => tag,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for MessageType {
    fn from(tag: &str) -> Self {
        Self::parse(tag)
    }
}

impl From<String> for MessageType {
    fn from(tag: String) -> Self {
        Self::parse(&tag)
    }
}

/// One handler per message type; registering again replaces the old one.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<MessageType, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handler that was replaced, if any.
    pub fn set(&mut self, message_type: impl Into<MessageType>, handler: Handler) -> Option<Handler> {
        self.handlers.insert(message_type.into(), handler)
    }

    pub fn remove(&mut self, message_type: impl Into<MessageType>) -> bool {
        self.handlers.remove(&message_type.into()).is_some()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.handlers.contains_key(&MessageType::parse(tag))
    }

    pub fn get_mut(&mut self, tag: &str) -> Option<&mut Handler> {
        self.handlers.get_mut(&MessageType::parse(tag))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}
