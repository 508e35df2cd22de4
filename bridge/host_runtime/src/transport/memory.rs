use super::Transport;
use crate::error::TransportError;
use crate::events::Waker;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};

pub type CallResponder = Box<dyn FnMut(&[u8]) -> Result<Vec<u8>, TransportError> + Send>;

#[derive(Debug, Default)]
pub struct TransportStats {
    transmits: AtomicU64,
    bytes_sent: AtomicU64,
    calls: AtomicU64,
}

impl TransportStats {
    pub fn transmits(&self) -> u64 {
        self.transmits.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

type WakerSlot = Arc<Mutex<Option<Waker>>>;

/// In-process boundary. Two ends made by [`MemoryTransport::pair`] see each
/// other's transmits in order; a transmit wakes the peer's bus if it has
/// attached a waker.
pub struct MemoryTransport {
    outgoing: Sender<Vec<u8>>,
    incoming: Receiver<Vec<u8>>,
    responder: Option<CallResponder>,
    stats: Arc<TransportStats>,
    own_waker: WakerSlot,
    peer_waker: WakerSlot,
}

impl MemoryTransport {
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();
        let a_waker: WakerSlot = Arc::default();
        let b_waker: WakerSlot = Arc::default();

        let a = Self {
            outgoing: a_tx,
            incoming: a_rx,
            responder: None,
            stats: Arc::default(),
            own_waker: a_waker.clone(),
            peer_waker: b_waker.clone(),
        };
        let b = Self {
            outgoing: b_tx,
            incoming: b_rx,
            responder: None,
            stats: Arc::default(),
            own_waker: b_waker,
            peer_waker: a_waker,
        };
        (a, b)
    }

    /// Answers synchronous `call`s on this end.
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Result<Vec<u8>, TransportError> + Send + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    pub fn stats(&self) -> Arc<TransportStats> {
        self.stats.clone()
    }
}

impl Transport for MemoryTransport {
    fn transmit(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.outgoing
            .send(bytes.to_vec())
            .map_err(|_| TransportError::Closed)?;
        self.stats.transmits.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_sent
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);

        if let Ok(slot) = self.peer_waker.lock() {
            if let Some(waker) = slot.as_ref() {
                waker.wake();
            }
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut received = Vec::new();
        loop {
            match self.incoming.try_recv() {
                Ok(chunk) => received.extend_from_slice(&chunk),
                Err(TryRecvError::Empty) => return Ok(received),
                Err(TryRecvError::Disconnected) if received.is_empty() => {
                    return Err(TransportError::Closed);
                }
                Err(TryRecvError::Disconnected) => return Ok(received),
            }
        }
    }

    fn call(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.stats.calls.fetch_add(1, Ordering::Relaxed);
        match self.responder.as_mut() {
            Some(responder) => responder(request),
            None => Err(TransportError::Unsupported("no call responder attached")),
        }
    }

    fn attach_waker(&mut self, waker: Waker) {
        if let Ok(mut slot) = self.own_waker.lock() {
            *slot = Some(waker);
        }
    }
}
