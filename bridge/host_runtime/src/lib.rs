//! Native side of the byte-encoded message bus between a platform host and
//! an embedded runtime.
//!
//! A [`MessageBus`] owns the handler registry, the RSVP reply correlator and
//! the resource table, and moves batches of framed [`Message`]s across a
//! [`Transport`] once per update cycle.

pub mod buffer;
pub mod bus;
pub mod codec;
pub mod config;
pub mod context;
pub mod correlator;
pub mod error;
pub mod events;
pub mod host;
pub mod message;
pub mod platform;
pub mod registry;
pub mod resources;
mod runner;
pub mod transport;
pub mod value;

pub use crate::bus::{BusState, CycleReport, MessageBus};
pub use crate::config::BusConfig;
pub use crate::context::HandlerContext;
pub use crate::correlator::{ReplyCallback, ReplyCorrelator};
pub use crate::error::{BusError, BusResult, TransportError};
pub use crate::events::{EventSender, Waker};
pub use crate::host::{HostBindings, run, serve};
pub use crate::message::{Message, NO_REPLY, REPLY_TYPE};
pub use crate::platform::PointerEventType;
pub use crate::registry::{Handler, HandlerRegistry, MessageType};
pub use crate::resources::{ResourceId, ResourceTable};
pub use crate::transport::{MemoryTransport, StreamTransport, Transport};
pub use crate::value::{Value, ValueKind};
pub use serde_json;
