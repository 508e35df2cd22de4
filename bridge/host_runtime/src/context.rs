use crate::buffer::OutboundBuffer;
use crate::correlator::{ReplyCallback, ReplyCorrelator};
use crate::error::BusResult;
use crate::message::{Message, NO_REPLY};

/// Requests raised while a cycle is in progress, acted on by the bus.
#[derive(Debug, Default)]
pub(crate) struct Signals {
    pub update_requested: bool,
    pub flush_requested: bool,
    pub stop_requested: bool,
}

/// What a handler or reply callback may do while it runs.
///
/// Posts land in the same outbound queue the cycle is about to flush, so
/// they go out in this cycle rather than the next one.
pub struct HandlerContext<'a> {
    outbound: &'a mut OutboundBuffer,
    correlator: &'a mut ReplyCorrelator<ReplyCallback>,
    signals: &'a mut Signals,
    max_frame_len: usize,
    request_id: i64,
    reply: Option<Message>,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(
        outbound: &'a mut OutboundBuffer,
        correlator: &'a mut ReplyCorrelator<ReplyCallback>,
        signals: &'a mut Signals,
        max_frame_len: usize,
        request_id: i64,
    ) -> Self {
        Self {
            outbound,
            correlator,
            signals,
            max_frame_len,
            request_id,
            reply: None,
        }
    }

    pub fn post(&mut self, message: Message) -> BusResult<()> {
        post_message(self.outbound, self.signals, &message, self.max_frame_len)
    }

    pub fn post_rsvp<F>(&mut self, message: Message, callback: F) -> BusResult<i64>
    where
        F: FnOnce(&mut HandlerContext<'_>, &Message) -> anyhow::Result<()> + Send + 'static,
    {
        post_rsvp_message(
            self.outbound,
            self.correlator,
            self.signals,
            message,
            Box::new(callback),
            self.max_frame_len,
        )
    }

    /// The reply to the message being handled, created on first use. It is
    /// sent once the handler returns, if the request asked for one.
    pub fn reply(&mut self) -> &mut Message {
        let request_id = self.request_id;
        self.reply
            .get_or_insert_with(|| Message::reply_to(request_id))
    }

    pub fn has_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Asks for the outbound queue to be flushed. Inside a cycle this is
    /// folded into the cycle's own flush.
    pub fn flush(&mut self) {
        self.signals.flush_requested = true;
    }

    pub fn stop(&mut self) {
        self.signals.stop_requested = true;
    }

    pub fn pending_replies(&self) -> usize {
        self.correlator.len()
    }

    pub(crate) fn take_reply(&mut self) -> Option<Message> {
        self.reply.take()
    }
}

pub(crate) fn post_message(
    outbound: &mut OutboundBuffer,
    signals: &mut Signals,
    message: &Message,
    max_frame_len: usize,
) -> BusResult<()> {
    outbound.push(message, max_frame_len)?;
    signals.update_requested = true;
    Ok(())
}

pub(crate) fn post_rsvp_message(
    outbound: &mut OutboundBuffer,
    correlator: &mut ReplyCorrelator<ReplyCallback>,
    signals: &mut Signals,
    mut message: Message,
    callback: ReplyCallback,
    max_frame_len: usize,
) -> BusResult<i64> {
    let id = correlator.register(callback)?;
    message.set_correlation_id(id);

    if let Err(err) = post_message(outbound, signals, &message, max_frame_len) {
        correlator.take(id);
        return Err(err);
    }
    Ok(id)
}

pub(crate) fn reply_id_for(message: &Message) -> i64 {
    if message.expects_reply() {
        message.correlation_id()
    } else {
        NO_REPLY
    }
}
