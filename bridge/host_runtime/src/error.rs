//! Bus and transport error types.

use std::io;
use thiserror::Error;

pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("unknown resource id: {0}")]
    UnknownResourceId(i64),

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// Informational: an inbound message had no registered handler.
    #[error("no handler registered for message type '{0}'")]
    HandlerNotFound(String),

    #[error("too many pending replies (limit {limit})")]
    TooManyPendingReplies { limit: usize },

    #[error("message too large: {len} > {max}")]
    MessageTooLarge { len: usize, max: usize },

    #[error("config error: {0}")]
    Config(String),
}

impl BusError {
    pub(crate) fn malformed(detail: impl Into<String>) -> Self {
        Self::MalformedMessage(detail.into())
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer closed the boundary")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("operation not supported by this transport: {0}")]
    Unsupported(&'static str),
}
