use crate::codec;
use crate::error::{BusError, BusResult};
use crate::message::Message;

/// Encoded messages waiting for the next flush, already framed.
#[derive(Debug, Default)]
pub struct OutboundBuffer {
    bytes: Vec<u8>,
    count: usize,
}

impl OutboundBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            count: 0,
        }
    }

    pub fn push(&mut self, message: &Message, max_frame_len: usize) -> BusResult<()> {
        let payload = message.encode()?;
        codec::write_frame(&mut self.bytes, &payload, max_frame_len)?;
        self.count += 1;
        Ok(())
    }

    /// Hands the queued batch to the caller, leaving the buffer empty.
    pub fn take(&mut self) -> (Vec<u8>, usize) {
        let count = std::mem::take(&mut self.count);
        (std::mem::take(&mut self.bytes), count)
    }

    /// Gives a flushed batch's allocation back for reuse.
    pub fn reclaim(&mut self, mut spent: Vec<u8>) {
        if self.bytes.is_empty() && spent.capacity() > self.bytes.capacity() {
            spent.clear();
            self.bytes = spent;
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
        self.count = 0;
    }
}

pub struct DecodeOutcome {
    pub messages: Vec<Message>,
    pub error: Option<BusError>,
}

/// Raw bytes received from the boundary, awaiting decode.
///
/// Only whole frames are decoded. A partial frame at the end stays buffered
/// for the next cycle, since stream transports may split a batch.
#[derive(Debug, Default)]
pub struct InboundBuffer {
    bytes: Vec<u8>,
}

impl InboundBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
        }
    }

    pub fn extend(&mut self, received: &[u8]) {
        self.bytes.extend_from_slice(received);
    }

    /// Decodes every complete frame in order. On the first bad frame the
    /// messages decoded so far are returned along with the error and the
    /// rest of the buffer is discarded.
    pub fn decode(&mut self, max_frame_len: usize) -> DecodeOutcome {
        let mut messages = Vec::new();
        let mut pos = 0;

        while pos < self.bytes.len() {
            let frame = match codec::read_frame(&self.bytes[pos..], max_frame_len) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    self.bytes.clear();
                    return DecodeOutcome {
                        messages,
                        error: Some(err),
                    };
                }
            };

            let (payload, used) = frame;
            match Message::decode(payload) {
                Ok(message) => messages.push(message),
                Err(err) => {
                    self.bytes.clear();
                    return DecodeOutcome {
                        messages,
                        error: Some(err),
                    };
                }
            }
            pos += used;
        }

        self.bytes.drain(..pos);
        DecodeOutcome {
            messages,
            error: None,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}
