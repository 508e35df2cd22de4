//! Hand-off from native threads to the update thread.
//!
//! The bus itself is single-threaded. Input and render callbacks that fire on
//! other threads push messages through an [`EventSender`]; the update loop
//! drains them at the start of each cycle.

use crate::message::Message;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError};
use std::time::Duration;

#[derive(Debug)]
pub(crate) enum BusEvent {
    Post(Message),
    Wake,
}

#[derive(Clone)]
pub struct EventSender {
    tx: SyncSender<BusEvent>,
    dropped: Arc<AtomicU64>,
    wake_pending: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    capacity: usize,
}

impl EventSender {
    /// Queues `message` for posting on the update thread. Returns `false`
    /// when the queue is full (the message is dropped) or the bus is gone.
    pub fn post(&self, message: Message) -> bool {
        match self.tx.try_send(BusEvent::Post(message)) {
            Ok(()) => true,
            Err(TrySendError::Full(BusEvent::Post(message))) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped.is_power_of_two() {
                    tracing::warn!(
                        capacity = self.capacity,
                        dropped,
                        message_type = message.type_tag(),
                        "event queue full; dropped native event(s)"
                    );
                }
                false
            }
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Disconnected(_)) => {
                tracing::debug!("event queue closed; bus no longer running");
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn waker(&self) -> Waker {
        Waker {
            tx: self.tx.clone(),
            pending: self.wake_pending.clone(),
        }
    }
}

/// Requests an early update cycle without posting anything. Transports use
/// this when bytes arrive from the peer.
///
/// At most one wake sits in the queue at a time, so a burst of inbound
/// frames never crowds out native posts.
#[derive(Clone)]
pub struct Waker {
    tx: SyncSender<BusEvent>,
    pending: Arc<AtomicBool>,
}

impl Waker {
    pub fn wake(&self) {
        if self.pending.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.tx.try_send(BusEvent::Wake).is_err() {
            // A full queue already guarantees a prompt cycle.
            self.pending.store(false, Ordering::Release);
        }
    }
}

pub(crate) struct EventQueue {
    rx: Receiver<BusEvent>,
    sender: EventSender,
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        self.sender.closed.store(true, Ordering::Release);
    }
}

impl EventQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::sync_channel(capacity);
        Self {
            rx,
            sender: EventSender {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
                wake_pending: Arc::new(AtomicBool::new(false)),
                closed: Arc::new(AtomicBool::new(false)),
                capacity,
            },
        }
    }

    pub(crate) fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    pub(crate) fn try_recv(&self) -> Option<BusEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(self.taken(event)),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub(crate) fn recv_timeout(&self, timeout: Duration) -> Option<BusEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(self.taken(event)),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    // Once the queued wake is consumed the next one has to be sent again.
    fn taken(&self, event: BusEvent) -> BusEvent {
        if matches!(event, BusEvent::Wake) {
            self.sender.wake_pending.store(false, Ordering::Release);
        }
        event
    }
}
