use crate::bus::MessageBus;
use crate::config::BusConfig;
use crate::events::EventSender;
use crate::message::Message;
use crate::transport::{StreamTransport, Transport};
use anyhow::Context;
use std::thread::JoinHandle;

/// What a native host plugs into the shared runtime.
pub trait HostBindings {
    /// Registers the host's message handlers on a fresh bus.
    fn install_handlers<T: Transport>(bus: &mut MessageBus<T>);

    /// Messages queued right after launch, ahead of anything else.
    fn launch_messages() -> Vec<Message> {
        Vec::new()
    }

    /// Starts threads that feed native events (timers, input pumps) into the
    /// bus. They should return once `events.is_connected()` turns false.
    fn spawn_event_sources(_events: EventSender) -> Vec<JoinHandle<()>> {
        Vec::new()
    }
}

/// Runs a host over stdin/stdout until the bus stops or stdin closes.
pub fn run<B: HostBindings>(config: BusConfig) -> anyhow::Result<()> {
    let transport = StreamTransport::stdio(config.max_frame_len);
    let (transport, result) = serve::<B, _>(transport, config);
    transport.shutdown();
    result
}

/// Runs a host over any transport and hands the transport back for teardown.
pub fn serve<B, T>(transport: T, config: BusConfig) -> (T, anyhow::Result<()>)
where
    B: HostBindings,
    T: Transport,
{
    let mut bus = MessageBus::new(transport, config);
    B::install_handlers(&mut bus);

    let mut sources = Vec::new();
    let result = launch(&mut bus, B::launch_messages()).and_then(|()| {
        sources = B::spawn_event_sources(bus.event_sender());
        bus.run().context("message bus terminated with error")
    });

    // Dropping the bus closes the event queue, which tells sources to exit.
    let transport = bus.into_transport();
    for handle in sources {
        if handle.is_finished() {
            if let Err(err) = handle.join() {
                tracing::warn!("event source thread join failed: {err:?}");
            }
        } else {
            // Avoid hanging exit on a source blocked in a native wait.
            tracing::debug!("event source still active during shutdown; skipping join");
        }
    }

    (transport, result)
}

fn launch<T: Transport>(bus: &mut MessageBus<T>, messages: Vec<Message>) -> anyhow::Result<()> {
    bus.launch().context("failed to launch message bus")?;
    for message in messages {
        bus.post(message).context("failed to queue launch message")?;
    }
    Ok(())
}
