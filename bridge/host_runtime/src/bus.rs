use crate::buffer::{InboundBuffer, OutboundBuffer};
use crate::config::BusConfig;
use crate::context::{self, HandlerContext, Signals};
use crate::correlator::{ReplyCallback, ReplyCorrelator};
use crate::error::{BusError, BusResult, TransportError};
use crate::events::{BusEvent, EventQueue, EventSender};
use crate::message::{Message, NO_REPLY};
use crate::registry::{HandlerRegistry, MessageType};
use crate::resources::{ResourceId, ResourceTable};
use crate::transport::Transport;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Unconfigured,
    Configured,
    Launched,
    Running,
    Idle,
    Stopped,
}

/// What one update cycle did.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub events_marshalled: usize,
    pub bytes_received: usize,
    pub decoded: usize,
    pub dispatched: usize,
    pub replies_resolved: usize,
    /// Replies nobody was waiting for and messages with no handler.
    pub dropped: usize,
    pub handler_failures: usize,
    pub messages_sent: usize,
    pub bytes_sent: usize,
    pub peer_closed: bool,
    pub errors: Vec<BusError>,
    /// The bus was not in a state that runs cycles.
    pub skipped: bool,
}

enum Invocation {
    Completed(Option<Message>),
    Failed,
    Missing,
}

/// The native end of the boundary: owns the handler registry, the pending
/// replies, the resource table and both buffers, and drives them from
/// [`MessageBus::update`].
///
/// Everything here runs on one thread. Other threads reach the bus through
/// an [`EventSender`].
pub struct MessageBus<T: Transport> {
    config: BusConfig,
    state: BusState,
    transport: T,
    handlers: HandlerRegistry,
    correlator: ReplyCorrelator<ReplyCallback>,
    resources: ResourceTable,
    outbound: OutboundBuffer,
    inbound: InboundBuffer,
    signals: Signals,
    is_sending: bool,
    next_wake: Option<Instant>,
    pub(crate) events: EventQueue,
}

impl<T: Transport> MessageBus<T> {
    pub fn new(transport: T, config: BusConfig) -> Self {
        Self {
            state: BusState::Unconfigured,
            transport,
            handlers: HandlerRegistry::new(),
            correlator: ReplyCorrelator::new(config.max_pending_replies),
            resources: ResourceTable::new(),
            outbound: OutboundBuffer::with_capacity(config.initial_buffer_capacity),
            inbound: InboundBuffer::with_capacity(config.initial_buffer_capacity),
            signals: Signals::default(),
            is_sending: false,
            next_wake: None,
            events: EventQueue::new(config.event_queue_cap),
            config,
        }
    }

    pub fn state(&self) -> BusState {
        self.state
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    pub fn set_idle_update_frequency(&mut self, seconds: f64) -> &mut Self {
        self.config.set_idle_update_frequency(seconds);
        self
    }

    /// Validates the configuration. Calling it again is a no-op.
    pub fn configure(&mut self) -> BusResult<()> {
        if self.state != BusState::Unconfigured {
            return Ok(());
        }

        self.config = self.config.clone().validate()?;
        self.state = BusState::Configured;
        tracing::debug!(config = ?self.config, "bus configured");
        Ok(())
    }

    /// Starts the update loop, configuring first if needed. A stopped bus
    /// resumes.
    pub fn launch(&mut self) -> BusResult<()> {
        match self.state {
            BusState::Unconfigured => {
                self.configure()?;
                self.launch()
            }
            BusState::Configured => {
                self.transport.attach_waker(self.events.sender().waker());
                self.state = BusState::Launched;
                tracing::info!("bus launched");
                Ok(())
            }
            BusState::Stopped => {
                self.start();
                Ok(())
            }
            BusState::Launched | BusState::Running | BusState::Idle => Ok(()),
        }
    }

    /// Drops everything tied to the previous session of the embedded side:
    /// pending replies, resource ids and buffered bytes. Handlers and
    /// configuration stay. Ids handed out before the relaunch never resolve.
    pub fn relaunch(&mut self) -> BusResult<()> {
        if matches!(self.state, BusState::Unconfigured | BusState::Configured) {
            return self.launch();
        }

        let abandoned = self.correlator.len();
        self.correlator.clear();
        self.resources.clear();
        self.outbound.clear();
        self.inbound.clear();
        self.signals = Signals::default();
        self.next_wake = None;
        self.state = BusState::Launched;
        tracing::info!(abandoned_replies = abandoned, "bus relaunched");
        Ok(())
    }

    pub fn start(&mut self) {
        match self.state {
            BusState::Stopped => {
                self.state = BusState::Launched;
                tracing::info!(queued = self.outbound.len(), "bus resumed");
            }
            BusState::Unconfigured | BusState::Configured => {
                if let Err(err) = self.launch() {
                    tracing::warn!("bus failed to start: {err}");
                }
            }
            BusState::Launched | BusState::Running | BusState::Idle => {}
        }
    }

    /// Pauses the update loop. Posts keep queueing and go out after `start`.
    pub fn stop(&mut self) {
        if self.state == BusState::Stopped {
            return;
        }
        self.state = BusState::Stopped;
        self.next_wake = None;
        tracing::info!(queued = self.outbound.len(), "bus stopped");
    }

    pub fn set_message_handler<F>(&mut self, message_type: impl Into<MessageType>, handler: F)
    where
        F: FnMut(&mut HandlerContext<'_>, &Message) -> anyhow::Result<()> + Send + 'static,
    {
        let message_type = message_type.into();
        if self.handlers.set(message_type.clone(), Box::new(handler)).is_some() {
            tracing::debug!(%message_type, "replaced message handler");
        }
    }

    pub fn remove_message_handler(&mut self, message_type: impl Into<MessageType>) {
        self.handlers.remove(message_type);
    }

    pub fn has_message_handler(&self, tag: &str) -> bool {
        self.handlers.contains(tag)
    }

    /// Queues `message` for the next flush and wakes an idle bus.
    pub fn post(&mut self, message: Message) -> BusResult<()> {
        context::post_message(
            &mut self.outbound,
            &mut self.signals,
            &message,
            self.config.max_frame_len,
        )
    }

    /// Posts `message` with a fresh correlation id; `callback` runs once when
    /// the matching reply arrives.
    pub fn post_rsvp<F>(&mut self, message: Message, callback: F) -> BusResult<i64>
    where
        F: FnOnce(&mut HandlerContext<'_>, &Message) -> anyhow::Result<()> + Send + 'static,
    {
        context::post_rsvp_message(
            &mut self.outbound,
            &mut self.correlator,
            &mut self.signals,
            message,
            Box::new(callback),
            self.config.max_frame_len,
        )
    }

    pub fn pending_replies(&self) -> usize {
        self.correlator.len()
    }

    pub fn queued_messages(&self) -> usize {
        self.outbound.len()
    }

    /// Synchronous round trip, used for bootstrap before the loop runs. Once
    /// the bus is running the queue is flushed first so ordering holds.
    pub fn send(&mut self, message: &Message) -> BusResult<Option<Message>> {
        if self.is_active() {
            self.flush()?;
        }

        let request = message.encode()?;
        if request.len() > self.config.max_frame_len {
            return Err(BusError::MessageTooLarge {
                len: request.len(),
                max: self.config.max_frame_len,
            });
        }

        let response = self.transport.call(&request)?;
        if response.is_empty() {
            return Ok(None);
        }
        Message::decode(&response).map(Some)
    }

    /// Writes the outbound queue to the transport now. Inside a cycle the
    /// request is folded into the cycle's own flush. A bus that is not
    /// running keeps its queue until it starts.
    pub fn flush(&mut self) -> BusResult<usize> {
        if !self.is_active() {
            return Ok(0);
        }
        if self.is_sending {
            self.signals.flush_requested = true;
            return Ok(0);
        }
        self.is_sending = true;
        let result = self.transmit_outbound();
        self.is_sending = false;
        result.map(|(count, _)| count)
    }

    pub fn get_resource_id<R: Any + Send + Sync>(&mut self, resource: &Arc<R>) -> ResourceId {
        self.resources.get_resource_id(resource)
    }

    pub fn resource_for<R: Any + Send + Sync>(&self, id: ResourceId) -> BusResult<Arc<R>> {
        self.resources.resource_for(id)
    }

    pub fn unregister_resource(&mut self, id: ResourceId) -> BusResult<()> {
        self.resources.unregister(id)
    }

    pub fn resources(&self) -> &ResourceTable {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut ResourceTable {
        &mut self.resources
    }

    /// Handle for posting from other threads.
    pub fn event_sender(&self) -> EventSender {
        self.events.sender()
    }

    /// Handles one synchronous request from the embedded side and returns the
    /// encoded reply, if the handler produced one. Replies arriving this way
    /// resolve pending RSVPs and yield nothing.
    pub fn dispatch_direct(&mut self, bytes: &[u8]) -> BusResult<Option<Vec<u8>>> {
        let message = Message::decode(bytes)?;

        if message.is_reply() {
            self.resolve_reply(&message);
            return Ok(None);
        }

        match self.invoke_handler(&message, message.correlation_id()) {
            Invocation::Completed(Some(reply)) => reply.encode().map(Some),
            Invocation::Completed(None) | Invocation::Failed => Ok(None),
            Invocation::Missing => Err(BusError::HandlerNotFound(message.type_tag().to_string())),
        }
    }

    /// When the next cycle is due, or `None` while the loop is not running.
    pub fn wake_deadline(&self, now: Instant) -> Option<Instant> {
        match self.state {
            BusState::Unconfigured | BusState::Configured | BusState::Stopped => None,
            BusState::Launched => Some(now),
            BusState::Running | BusState::Idle => {
                if self.signals.update_requested {
                    Some(now)
                } else {
                    self.next_wake
                }
            }
        }
    }

    /// Runs a cycle if one is due at `now`.
    pub fn poll(&mut self, now: Instant) -> Option<CycleReport> {
        match self.wake_deadline(now) {
            Some(deadline) if deadline <= now => Some(self.update(now)),
            _ => None,
        }
    }

    /// One full update cycle: marshal cross-thread events, receive, decode,
    /// dispatch, flush, then pick the next state.
    pub fn update(&mut self, now: Instant) -> CycleReport {
        let mut report = CycleReport::default();
        if matches!(
            self.state,
            BusState::Unconfigured | BusState::Configured | BusState::Stopped
        ) {
            report.skipped = true;
            return report;
        }

        self.marshal_events(&mut report);

        if self.receive_inbound(&mut report) {
            self.is_sending = true;
            self.dispatch_inbound(&mut report);
            self.flush_in_cycle(&mut report);
            self.is_sending = false;
        }

        self.schedule(now, &report);
        report
    }

    pub(crate) fn note_wake(&mut self) {
        self.signals.update_requested = true;
    }

    fn is_active(&self) -> bool {
        matches!(
            self.state,
            BusState::Launched | BusState::Running | BusState::Idle
        )
    }

    fn marshal_events(&mut self, report: &mut CycleReport) {
        while let Some(event) = self.events.try_recv() {
            match event {
                BusEvent::Post(message) => {
                    report.events_marshalled += 1;
                    if let Err(err) = self.post(message) {
                        tracing::warn!("dropping marshalled event: {err}");
                        report.errors.push(err);
                    }
                }
                BusEvent::Wake => {}
            }
        }
    }

    /// Returns `false` when the cycle cannot continue.
    fn receive_inbound(&mut self, report: &mut CycleReport) -> bool {
        match self.transport.receive() {
            Ok(bytes) => {
                report.bytes_received = bytes.len();
                self.inbound.extend(&bytes);
                true
            }
            Err(TransportError::Closed) => {
                tracing::info!("peer closed the boundary");
                report.peer_closed = true;
                false
            }
            Err(err) => {
                tracing::warn!("receive failed; discarding buffered input: {err}");
                self.inbound.clear();
                report.errors.push(err.into());
                false
            }
        }
    }

    fn dispatch_inbound(&mut self, report: &mut CycleReport) {
        let outcome = self.inbound.decode(self.config.max_frame_len);
        report.decoded = outcome.messages.len();

        for message in &outcome.messages {
            if message.is_reply() {
                match self.resolve_reply(message) {
                    Some(true) => report.replies_resolved += 1,
                    Some(false) => {
                        report.replies_resolved += 1;
                        report.handler_failures += 1;
                    }
                    None => report.dropped += 1,
                }
                continue;
            }

            let request_id = context::reply_id_for(message);
            match self.invoke_handler(message, request_id) {
                Invocation::Completed(reply) => {
                    report.dispatched += 1;
                    if let Some(reply) = reply {
                        self.post_reply(message, reply, report);
                    }
                }
                Invocation::Failed => {
                    report.dispatched += 1;
                    report.handler_failures += 1;
                }
                Invocation::Missing => {
                    tracing::debug!(
                        "{}",
                        BusError::HandlerNotFound(message.type_tag().to_string())
                    );
                    report.dropped += 1;
                }
            }
        }

        if let Some(err) = outcome.error {
            tracing::warn!(
                dispatched_before_error = report.decoded,
                "discarding rest of inbound batch: {err}"
            );
            report.errors.push(err);
        }
    }

    fn post_reply(&mut self, request: &Message, reply: Message, report: &mut CycleReport) {
        if !request.expects_reply() {
            tracing::debug!(
                message_type = request.type_tag(),
                "handler replied to a message that expects no reply"
            );
            return;
        }
        if let Err(err) = self.post(reply) {
            tracing::warn!(message_type = request.type_tag(), "failed to queue reply: {err}");
            report.errors.push(err);
        }
    }

    fn invoke_handler(&mut self, message: &Message, request_id: i64) -> Invocation {
        let max_frame_len = self.config.max_frame_len;
        let Some(handler) = self.handlers.get_mut(message.type_tag()) else {
            return Invocation::Missing;
        };

        let mut ctx = HandlerContext::new(
            &mut self.outbound,
            &mut self.correlator,
            &mut self.signals,
            max_frame_len,
            request_id,
        );
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&mut ctx, message)));
        let reply = ctx.take_reply();

        if handler_succeeded(outcome, message.type_tag(), "message handler") {
            Invocation::Completed(reply)
        } else {
            Invocation::Failed
        }
    }

    /// `None` when no request was waiting on this id.
    fn resolve_reply(&mut self, reply: &Message) -> Option<bool> {
        let id = reply.correlation_id();
        let Some(callback) = self.correlator.take(id) else {
            tracing::debug!(correlation_id = id, "dropping reply with no pending request");
            return None;
        };

        let max_frame_len = self.config.max_frame_len;
        let mut ctx = HandlerContext::new(
            &mut self.outbound,
            &mut self.correlator,
            &mut self.signals,
            max_frame_len,
            NO_REPLY,
        );
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&mut ctx, reply)));
        Some(handler_succeeded(outcome, reply.type_tag(), "reply callback"))
    }

    fn flush_in_cycle(&mut self, report: &mut CycleReport) {
        match self.transmit_outbound() {
            Ok((count, bytes)) => {
                report.messages_sent = count;
                report.bytes_sent = bytes;
            }
            Err(err) => {
                if matches!(err, BusError::Transport(TransportError::Closed)) {
                    report.peer_closed = true;
                }
                report.errors.push(err);
            }
        }
        self.signals.flush_requested = false;
        // Everything posted so far went out with this flush.
        self.signals.update_requested = false;
    }

    /// A failed transmit drops the batch rather than retrying it forever.
    fn transmit_outbound(&mut self) -> BusResult<(usize, usize)> {
        if self.outbound.is_empty() {
            return Ok((0, 0));
        }

        let (batch, count) = self.outbound.take();
        let result = self.transport.transmit(&batch);
        let bytes = batch.len();
        self.outbound.reclaim(batch);

        match result {
            Ok(()) => Ok((count, bytes)),
            Err(err) => {
                tracing::warn!(messages = count, bytes, "dropping outbound batch: {err}");
                Err(err.into())
            }
        }
    }

    fn schedule(&mut self, now: Instant, report: &CycleReport) {
        if std::mem::take(&mut self.signals.stop_requested) {
            self.stop();
            return;
        }
        if report.peer_closed {
            return;
        }

        let busy = report.decoded > 0
            || report.events_marshalled > 0
            || report.messages_sent > 0
            || !self.outbound.is_empty();
        if busy {
            self.state = BusState::Running;
            self.next_wake = Some(now);
        } else {
            self.state = BusState::Idle;
            self.next_wake = Some(now + self.config.idle_interval());
        }
    }
}

fn handler_succeeded(
    outcome: std::thread::Result<anyhow::Result<()>>,
    message_type: &str,
    what: &str,
) -> bool {
    match outcome {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            tracing::warn!(message_type, "{what} failed: {err:#}");
            false
        }
        Err(payload) => {
            tracing::warn!(message_type, "{what} panicked: {}", panic_message(payload.as_ref()));
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::config::DEFAULT_MAX_FRAME_LEN;
    use crate::platform::{self, PointerEventType};
    use crate::transport::MemoryTransport;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const CAP: usize = DEFAULT_MAX_FRAME_LEN;

    fn launched_bus() -> (MessageBus<MemoryTransport>, MemoryTransport) {
        let (local, peer) = MemoryTransport::pair();
        let mut bus = MessageBus::new(local, BusConfig::default());
        bus.launch().expect("launch");
        (bus, peer)
    }

    fn deliver(peer: &mut MemoryTransport, messages: &[Message]) {
        let batch = codec::encode_batch(messages, CAP).expect("encode batch");
        peer.transmit(&batch).expect("peer transmit");
    }

    fn drain(peer: &mut MemoryTransport) -> Vec<Message> {
        let bytes = peer.receive().expect("peer receive");
        codec::decode_batch(&bytes, CAP).expect("decode batch")
    }

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        (count.clone(), count)
    }

    #[test]
    fn pointer_event_reaches_its_handler_once() {
        let (mut bus, mut peer) = launched_bus();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.set_message_handler(MessageType::DisplayOnPointerEvent, move |_ctx, message| {
            sink.lock().expect("lock").push(message.clone());
            Ok(())
        });

        deliver(
            &mut peer,
            &[platform::pointer_event(1, "Main", PointerEventType::Press, 10.5, 20.0, 0)],
        );
        let report = bus.update(Instant::now());
        assert_eq!(report.decoded, 1);
        assert_eq!(report.dispatched, 1);

        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 1);
        let event = &seen[0];
        assert_eq!(event.get_long("window_id"), 1);
        assert_eq!(event.get_string("display_name"), "Main");
        assert_eq!(event.get_long("type"), 1);
        assert_eq!(event.get_double("x"), 10.5);
        assert_eq!(event.get_double("y"), 20.0);
        assert_eq!(event.get_long("index"), 0);
    }

    #[test]
    fn replacing_a_handler_routes_to_the_new_one() {
        let (mut bus, mut peer) = launched_bus();
        let (first, first_seen) = counter();
        let (second, second_seen) = counter();

        bus.set_message_handler("Display.density", move |_ctx, _m| {
            first.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.set_message_handler("Display.density", move |_ctx, _m| {
            second.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        deliver(&mut peer, &[Message::new("Display.density")]);
        bus.update(Instant::now());

        assert_eq!(first_seen.load(Ordering::SeqCst), 0);
        assert_eq!(second_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_handler_drops_the_message() {
        let (mut bus, mut peer) = launched_bus();
        bus.set_message_handler("Application.log", |_ctx, _m| Ok(()));
        bus.remove_message_handler("Application.log");
        bus.remove_message_handler("Application.log");
        assert!(!bus.has_message_handler("Application.log"));

        deliver(&mut peer, &[Message::new("Application.log")]);
        let report = bus.update(Instant::now());
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.dropped, 1);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn two_rsvps_resolve_independently() {
        let (mut bus, mut peer) = launched_bus();
        let densities = Arc::new(Mutex::new(Vec::new()));
        let (second, second_seen) = counter();

        let sink = densities.clone();
        let first_id = bus
            .post_rsvp(Message::new("Display.density"), move |_ctx, reply| {
                sink.lock().expect("lock").push(reply.get_double("density"));
                Ok(())
            })
            .expect("first rsvp");
        let second_id = bus
            .post_rsvp(Message::new("Display.safe_insets"), move |_ctx, _reply| {
                second.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .expect("second rsvp");
        assert!(first_id > 0);
        assert!(second_id > first_id);

        bus.update(Instant::now());
        let sent = drain(&mut peer);
        let ids: Vec<i64> = sent.iter().map(Message::correlation_id).collect();
        assert_eq!(ids, vec![first_id, second_id]);

        deliver(&mut peer, &[Message::reply_to(first_id).with("density", 2.0)]);
        let report = bus.update(Instant::now());

        assert_eq!(report.replies_resolved, 1);
        assert_eq!(*densities.lock().expect("lock"), vec![2.0]);
        assert_eq!(second_seen.load(Ordering::SeqCst), 0);
        assert_eq!(bus.pending_replies(), 1);
    }

    #[test]
    fn a_reply_resolves_at_most_once() {
        let (mut bus, mut peer) = launched_bus();
        let (calls, calls_seen) = counter();
        let id = bus
            .post_rsvp(Message::new("Display.density"), move |_ctx, _reply| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .expect("rsvp");

        deliver(&mut peer, &[Message::reply_to(id), Message::reply_to(id)]);
        let report = bus.update(Instant::now());
        assert_eq!(report.replies_resolved, 1);
        assert_eq!(report.dropped, 1);

        deliver(&mut peer, &[Message::reply_to(id)]);
        bus.update(Instant::now());
        assert_eq!(calls_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn relaunch_forgets_replies_and_resources_but_keeps_handlers() {
        let (mut bus, mut peer) = launched_bus();
        let (calls, calls_seen) = counter();
        let (handled, handled_seen) = counter();
        bus.set_message_handler("Application.on_start", move |_ctx, _m| {
            handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let old_id = bus
            .post_rsvp(Message::new("Display.density"), move |_ctx, _reply| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .expect("rsvp");
        let texture = Arc::new(String::from("texture"));
        let resource_id = bus.get_resource_id(&texture);

        bus.relaunch().expect("relaunch");
        assert_eq!(bus.state(), BusState::Launched);
        assert_eq!(bus.pending_replies(), 0);
        assert_eq!(bus.queued_messages(), 0);
        assert!(matches!(
            bus.resource_for::<String>(resource_id),
            Err(BusError::UnknownResourceId(_))
        ));

        deliver(
            &mut peer,
            &[Message::reply_to(old_id), Message::new("Application.on_start")],
        );
        let report = bus.update(Instant::now());
        assert_eq!(report.dropped, 1);
        assert_eq!(calls_seen.load(Ordering::SeqCst), 0);
        assert_eq!(handled_seen.load(Ordering::SeqCst), 1);

        let new_id = bus
            .post_rsvp(Message::new("Display.density"), |_ctx, _reply| Ok(()))
            .expect("rsvp after relaunch");
        assert!(new_id > old_id);
        assert!(bus.get_resource_id(&texture) > resource_id);
    }

    #[test]
    fn idle_bus_stays_quiet_until_something_is_posted() {
        let (local, _peer) = MemoryTransport::pair();
        let stats = local.stats();
        let mut bus = MessageBus::new(local, BusConfig::default());
        bus.launch().expect("launch");

        let start = Instant::now();
        bus.poll(start).expect("launched bus cycles immediately");
        assert_eq!(bus.state(), BusState::Idle);

        let deadline = bus.wake_deadline(start).expect("idle deadline");
        assert_eq!(deadline, start + Duration::from_millis(500));
        assert!(bus.poll(start + Duration::from_millis(250)).is_none());
        bus.poll(deadline).expect("idle tick");
        assert_eq!(stats.transmits(), 0);

        let later = deadline + Duration::from_millis(10);
        bus.post(Message::new("Application.on_start")).expect("post");
        assert_eq!(bus.wake_deadline(later), Some(later));

        let report = bus.poll(later).expect("post wakes the bus");
        assert_eq!(report.messages_sent, 1);
        assert_eq!(stats.transmits(), 1);
        assert_eq!(bus.state(), BusState::Running);

        bus.poll(later).expect("one more pass");
        assert_eq!(bus.state(), BusState::Idle);
    }

    #[test]
    fn reentrant_posts_go_out_in_the_same_transmit() {
        let (local, mut peer) = MemoryTransport::pair();
        let stats = local.stats();
        let mut bus = MessageBus::new(local, BusConfig::default());
        bus.launch().expect("launch");

        bus.set_message_handler("Ping", |ctx, _m| {
            ctx.post(Message::new("Pong").with("n", 1))?;
            ctx.post(Message::new("Pong").with("n", 2))?;
            ctx.flush();
            ctx.reply().set("ok", true);
            Ok(())
        });

        deliver(&mut peer, &[Message::new("Ping").with_correlation_id(7)]);
        let report = bus.update(Instant::now());

        assert_eq!(stats.transmits(), 1);
        assert_eq!(report.messages_sent, 3);
        let sent = drain(&mut peer);
        let tags: Vec<&str> = sent.iter().map(Message::type_tag).collect();
        assert_eq!(tags, vec!["Pong", "Pong", "reply"]);
        assert_eq!(sent[2].correlation_id(), 7);
        assert!(sent[2].get_bool("ok"));
    }

    #[test]
    fn fire_and_forget_messages_get_no_reply() {
        let (mut bus, mut peer) = launched_bus();
        bus.set_message_handler("Display.density", |ctx, _m| {
            ctx.reply().set("density", 2.0);
            Ok(())
        });

        deliver(&mut peer, &[Message::new("Display.density")]);
        let report = bus.update(Instant::now());
        assert_eq!(report.messages_sent, 0);
    }

    #[test]
    fn failing_handlers_do_not_stop_the_cycle() {
        let (mut bus, mut peer) = launched_bus();
        bus.set_message_handler("Boom", |_ctx, _m| panic!("handler exploded"));
        bus.set_message_handler("Fail", |_ctx, _m| Err(anyhow::anyhow!("nope")));
        bus.set_message_handler("Fine", |ctx, _m| {
            ctx.post(Message::new("Done"))?;
            Ok(())
        });

        deliver(
            &mut peer,
            &[Message::new("Boom"), Message::new("Fail"), Message::new("Fine")],
        );
        let report = bus.update(Instant::now());

        assert_eq!(report.dispatched, 3);
        assert_eq!(report.handler_failures, 2);
        assert_eq!(report.messages_sent, 1);
        assert_eq!(drain(&mut peer)[0].type_tag(), "Done");
    }

    #[test]
    fn malformed_input_is_reported_and_the_loop_continues() {
        let (mut bus, mut peer) = launched_bus();
        let (calls, calls_seen) = counter();
        bus.set_message_handler("Tick", move |_ctx, _m| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.post(Message::new("Queued")).expect("post");

        let mut batch = codec::encode_batch([&Message::new("Tick")], CAP).expect("encode");
        batch.extend_from_slice(&[0, 0, 0, 2, 0xFF, 0xFF]);
        batch.extend(codec::encode_batch([&Message::new("Tick")], CAP).expect("encode"));
        peer.transmit(&batch).expect("transmit");

        let report = bus.update(Instant::now());
        assert_eq!(report.decoded, 1);
        assert_eq!(report.messages_sent, 1);
        match report.errors.as_slice() {
            [BusError::MalformedMessage(_)] => {}
            other => panic!("expected one malformed message error, got {other:?}"),
        }

        deliver(&mut peer, &[Message::new("Tick")]);
        let report = bus.update(Instant::now());
        assert!(report.errors.is_empty());
        assert_eq!(calls_seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn partial_frames_wait_for_the_rest() {
        let (mut bus, mut peer) = launched_bus();
        bus.set_message_handler("Tick", |_ctx, _m| Ok(()));

        let batch = codec::encode_batch([&Message::new("Tick")], CAP).expect("encode");
        let (head, tail) = batch.split_at(batch.len() / 2);

        peer.transmit(head).expect("transmit head");
        assert_eq!(bus.update(Instant::now()).decoded, 0);

        peer.transmit(tail).expect("transmit tail");
        assert_eq!(bus.update(Instant::now()).dispatched, 1);
    }

    #[test]
    fn stopped_bus_holds_posts_until_started() {
        let (local, mut peer) = MemoryTransport::pair();
        let stats = local.stats();
        let mut bus = MessageBus::new(local, BusConfig::default());
        bus.launch().expect("launch");

        bus.stop();
        bus.post(Message::new("Application.on_save")).expect("post");
        let now = Instant::now();
        assert_eq!(bus.wake_deadline(now), None);
        assert!(bus.poll(now).is_none());
        assert!(bus.update(now).skipped);
        assert_eq!(stats.transmits(), 0);

        bus.start();
        let report = bus.poll(now).expect("resumed bus cycles");
        assert_eq!(report.messages_sent, 1);
        assert_eq!(drain(&mut peer)[0].type_tag(), "Application.on_save");
    }

    #[test]
    fn explicit_flush_waits_while_stopped() {
        let (local, mut peer) = MemoryTransport::pair();
        let stats = local.stats();
        let mut bus = MessageBus::new(local, BusConfig::default());
        assert_eq!(bus.flush().expect("flush before launch"), 0);
        bus.launch().expect("launch");

        bus.stop();
        bus.post(Message::new("Application.on_save")).expect("post");
        assert_eq!(bus.flush().expect("flush while stopped"), 0);
        assert_eq!(stats.transmits(), 0);
        assert_eq!(bus.queued_messages(), 1);

        bus.start();
        assert_eq!(bus.flush().expect("flush after start"), 1);
        assert_eq!(drain(&mut peer)[0].type_tag(), "Application.on_save");
    }

    #[test]
    fn handler_can_stop_the_bus() {
        let (mut bus, mut peer) = launched_bus();
        bus.set_message_handler("Application.quit", |ctx, _m| {
            ctx.stop();
            Ok(())
        });

        deliver(&mut peer, &[Message::new("Application.quit")]);
        bus.update(Instant::now());
        assert_eq!(bus.state(), BusState::Stopped);
        assert_eq!(bus.wake_deadline(Instant::now()), None);
    }

    #[test]
    fn send_uses_the_synchronous_call() {
        let (local, _peer) = MemoryTransport::pair();
        let local = local.with_responder(|request| {
            let request = Message::decode(request).expect("request decodes");
            assert_eq!(request.type_tag(), "Application.config");
            Ok(Message::reply_to(0)
                .with("name", "demo")
                .encode()
                .expect("reply encodes"))
        });
        let stats = local.stats();
        let mut bus = MessageBus::new(local, BusConfig::default());

        bus.post(Message::new("Queued")).expect("post");
        let reply = bus
            .send(&Message::new("Application.config"))
            .expect("send")
            .expect("reply");

        assert_eq!(reply.get_string("name"), "demo");
        assert_eq!(stats.calls(), 1);
        assert_eq!(stats.transmits(), 0);
        assert_eq!(bus.queued_messages(), 1);
    }

    #[test]
    fn send_flushes_first_once_running() {
        let (local, mut peer) = MemoryTransport::pair();
        let local = local.with_responder(|_request| Ok(Vec::new()));
        let mut bus = MessageBus::new(local, BusConfig::default());
        bus.launch().expect("launch");

        bus.post(Message::new("Earlier")).expect("post");
        assert!(bus.send(&Message::new("Later")).expect("send").is_none());
        assert_eq!(drain(&mut peer)[0].type_tag(), "Earlier");
    }

    #[test]
    fn dispatch_direct_returns_the_encoded_reply() {
        let (mut bus, _peer) = launched_bus();
        bus.set_message_handler("Display.density", |ctx, _m| {
            ctx.reply().set("density", 2.0);
            Ok(())
        });
        bus.set_message_handler("Application.log", |_ctx, _m| Ok(()));

        let request = Message::new("Display.density").encode().expect("encode");
        let reply = bus
            .dispatch_direct(&request)
            .expect("dispatch")
            .expect("reply bytes");
        let reply = Message::decode(&reply).expect("decode reply");
        assert!(reply.is_reply());
        assert_eq!(reply.get_double("density"), 2.0);

        let log = Message::new("Application.log").encode().expect("encode");
        assert!(bus.dispatch_direct(&log).expect("dispatch").is_none());

        let unknown = Message::new("Nobody.home").encode().expect("encode");
        match bus.dispatch_direct(&unknown) {
            Err(BusError::HandlerNotFound(tag)) => assert_eq!(tag, "Nobody.home"),
            other => panic!("expected missing handler, got {other:?}"),
        }
    }

    #[test]
    fn events_from_other_threads_are_posted_in_the_next_cycle() {
        let (mut bus, mut peer) = launched_bus();
        let sender = bus.event_sender();

        std::thread::spawn(move || {
            assert!(sender.post(platform::render_event(1, "Main", (800, 600), (800, 600))));
        })
        .join()
        .expect("native thread");

        let report = bus.update(Instant::now());
        assert_eq!(report.events_marshalled, 1);
        assert_eq!(report.messages_sent, 1);
        assert_eq!(drain(&mut peer)[0].type_tag(), "Display.on_render");
    }

    #[test]
    fn closed_peer_is_reported() {
        let (mut bus, peer) = launched_bus();
        drop(peer);

        let report = bus.update(Instant::now());
        assert!(report.peer_closed);
    }

    #[test]
    fn two_buses_talk_over_a_memory_pair() {
        let (a, b) = MemoryTransport::pair();
        let mut native = MessageBus::new(a, BusConfig::default());
        let mut embedded = MessageBus::new(b, BusConfig::default());
        native.launch().expect("launch native");
        embedded.launch().expect("launch embedded");

        embedded.set_message_handler("Display.density", |ctx, _m| {
            ctx.reply().set("density", 3.0);
            Ok(())
        });

        let density = Arc::new(Mutex::new(None));
        let sink = density.clone();
        native
            .post_rsvp(Message::new("Display.density"), move |_ctx, reply| {
                *sink.lock().expect("lock") = Some(reply.get_double("density"));
                Ok(())
            })
            .expect("rsvp");

        let now = Instant::now();
        native.update(now);
        assert_eq!(embedded.update(now).dispatched, 1);
        assert_eq!(native.update(now).replies_resolved, 1);
        assert_eq!(*density.lock().expect("lock"), Some(3.0));
    }

    #[test]
    fn inbound_bursts_do_not_crowd_out_native_events() {
        let (local, mut peer) = MemoryTransport::pair();
        let config = BusConfig {
            event_queue_cap: 4,
            ..BusConfig::default()
        };
        let mut bus = MessageBus::new(local, config);
        bus.launch().expect("launch");
        let sender = bus.event_sender();

        for _ in 0..8 {
            deliver(&mut peer, &[Message::new("Application.on_update")]);
        }
        assert!(sender.post(Message::new("Display.on_pointer_event")));
        assert_eq!(sender.dropped_count(), 0);

        let report = bus.update(Instant::now());
        assert_eq!(report.decoded, 8);
        assert_eq!(report.events_marshalled, 1);
        assert_eq!(drain(&mut peer)[0].type_tag(), "Display.on_pointer_event");
    }

    /// Fails the first `failures` transmits with an I/O error.
    struct FailingTransport {
        failures: usize,
        delivered: Vec<Vec<u8>>,
    }

    impl Transport for FailingTransport {
        fn transmit(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "pipe closed",
                )));
            }
            self.delivered.push(bytes.to_vec());
            Ok(())
        }

        fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn failed_transmit_drops_the_batch_and_the_next_cycle_recovers() {
        let transport = FailingTransport {
            failures: 1,
            delivered: Vec::new(),
        };
        let mut bus = MessageBus::new(transport, BusConfig::default());
        bus.launch().expect("launch");

        bus.post(Message::new("Application.on_save")).expect("post");
        let report = bus.update(Instant::now());
        assert_eq!(report.messages_sent, 0);
        assert!(!report.peer_closed);
        match report.errors.as_slice() {
            [BusError::Transport(TransportError::Io(_))] => {}
            other => panic!("expected one transport error, got {other:?}"),
        }
        assert_eq!(bus.queued_messages(), 0);
        assert!(bus.transport().delivered.is_empty());

        bus.post(Message::new("Application.on_update")).expect("post");
        let report = bus.update(Instant::now());
        assert!(report.errors.is_empty());
        assert_eq!(report.messages_sent, 1);

        let delivered = &bus.transport().delivered;
        assert_eq!(delivered.len(), 1);
        let sent = codec::decode_batch(&delivered[0], CAP).expect("decode");
        assert_eq!(sent[0].type_tag(), "Application.on_update");
    }

    #[test]
    fn configure_rejects_invalid_settings() {
        let (local, _peer) = MemoryTransport::pair();
        let config = BusConfig {
            max_pending_replies: 0,
            ..BusConfig::default()
        };
        let mut bus = MessageBus::new(local, config);
        assert!(matches!(bus.launch(), Err(BusError::Config(_))));
        assert_eq!(bus.state(), BusState::Unconfigured);
    }
}
