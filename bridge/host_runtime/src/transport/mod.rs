//! The boundary between the native host and the embedded runtime.

mod memory;
mod stream;

pub use memory::{CallResponder, MemoryTransport, TransportStats};
pub use stream::StreamTransport;

use crate::error::TransportError;
use crate::events::Waker;

/// Moves raw bytes across the boundary. Implementations must deliver bytes
/// in the order they were transmitted.
pub trait Transport {
    /// Hands a batch of framed messages to the other side.
    fn transmit(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Returns whatever arrived since the last call, possibly nothing.
    /// Yields `TransportError::Closed` once the peer is gone and drained.
    fn receive(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Synchronous request/response used before the update loop exists.
    fn call(&mut self, _request: &[u8]) -> Result<Vec<u8>, TransportError> {
        Err(TransportError::Unsupported("synchronous call"))
    }

    /// Lets the transport trigger an early update when data arrives.
    fn attach_waker(&mut self, _waker: Waker) {}
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn transmit(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).transmit(bytes)
    }

    fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        (**self).receive()
    }

    fn call(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        (**self).call(request)
    }

    fn attach_waker(&mut self, waker: Waker) {
        (**self).attach_waker(waker)
    }
}
