use crate::bus::MessageBus;
use crate::error::BusResult;
use crate::events::BusEvent;
use crate::transport::Transport;
use std::time::Instant;

impl<T: Transport> MessageBus<T> {
    /// Drives the update loop on the calling thread until the bus is stopped
    /// or the peer closes the boundary.
    ///
    /// Between cycles the thread sleeps on the event queue, so posts from
    /// [`EventSender`](crate::EventSender)s and transport wakes cut the
    /// idle wait short.
    pub fn run(&mut self) -> BusResult<()> {
        self.launch()?;

        loop {
            if let Some(report) = self.poll(Instant::now()) {
                if report.peer_closed {
                    self.stop();
                    return Ok(());
                }
            }

            let now = Instant::now();
            let Some(deadline) = self.wake_deadline(now) else {
                return Ok(());
            };
            let timeout = deadline.saturating_duration_since(now);
            if timeout.is_zero() {
                continue;
            }

            match self.events.recv_timeout(timeout) {
                Some(BusEvent::Post(message)) => {
                    if let Err(err) = self.post(message) {
                        tracing::warn!("dropping marshalled event: {err}");
                    }
                }
                Some(BusEvent::Wake) => self.note_wake(),
                None => {}
            }
        }
    }
}
