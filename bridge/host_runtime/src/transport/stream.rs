use super::Transport;
use crate::codec::FRAME_HEADER_LEN;
use crate::error::TransportError;
use crate::events::Waker;
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Boundary over a byte stream pair (stdio of a child runtime, a socket...).
///
/// Batches are already sequences of length-prefixed frames, so the writer
/// copies them to the stream as-is. The reader checks each frame against the
/// size cap and hands whole frames to the bus.
pub struct StreamTransport {
    outgoing: Option<Sender<Vec<u8>>>,
    incoming: Receiver<Vec<u8>>,
    waker: Arc<Mutex<Option<Waker>>>,
    reader_error: Arc<Mutex<Option<io::Error>>>,
    reader_handle: Option<JoinHandle<io::Result<()>>>,
    writer_handle: Option<JoinHandle<io::Result<()>>>,
}

impl StreamTransport {
    pub fn spawn<R, W>(reader: R, writer: W, max_frame_len: usize) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel();
        let (in_tx, in_rx) = mpsc::channel();
        let waker: Arc<Mutex<Option<Waker>>> = Arc::default();
        let reader_error: Arc<Mutex<Option<io::Error>>> = Arc::default();

        let writer_handle = thread::spawn(move || writer_loop(writer, out_rx));

        let reader_waker = waker.clone();
        let reader_failure = reader_error.clone();
        let reader_handle = thread::spawn(move || {
            let result = reader_loop(reader, max_frame_len, |frame| {
                if in_tx.send(frame).is_err() {
                    return false;
                }
                if let Ok(slot) = reader_waker.lock() {
                    if let Some(waker) = slot.as_ref() {
                        waker.wake();
                    }
                }
                true
            });

            if let Err(err) = &result {
                tracing::warn!("boundary reader terminated with error: {err}");
                if let Ok(mut slot) = reader_failure.lock() {
                    *slot = Some(io::Error::new(err.kind(), err.to_string()));
                }
            }
            // Wake once more so the bus notices the closed stream promptly.
            if let Ok(slot) = reader_waker.lock() {
                if let Some(waker) = slot.as_ref() {
                    waker.wake();
                }
            }
            result
        });

        Self {
            outgoing: Some(out_tx),
            incoming: in_rx,
            waker,
            reader_error,
            reader_handle: Some(reader_handle),
            writer_handle: Some(writer_handle),
        }
    }

    pub fn stdio(max_frame_len: usize) -> Self {
        Self::spawn(io::stdin(), io::stdout(), max_frame_len)
    }

    /// Closes the outgoing side and reaps whichever threads have finished.
    pub fn shutdown(mut self) {
        self.outgoing = None;

        if let Some(handle) = self.writer_handle.take() {
            // Give the writer the chance to flush what was queued.
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!("writer thread returned error: {err}"),
                Err(err) => tracing::warn!("writer thread join failed: {err:?}"),
            }
        }

        if let Some(handle) = self.reader_handle.take() {
            if handle.is_finished() {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => tracing::warn!("reader thread returned error: {err}"),
                    Err(err) => tracing::warn!("reader thread join failed: {err:?}"),
                }
            } else {
                // Avoid hanging exit on a blocked stdio read during teardown.
                tracing::debug!("reader thread still active during shutdown; skipping join");
            }
        }
    }
}

impl Transport for StreamTransport {
    fn transmit(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let outgoing = self.outgoing.as_ref().ok_or(TransportError::Closed)?;
        outgoing
            .send(bytes.to_vec())
            .map_err(|_| TransportError::Closed)
    }

    fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut received = Vec::new();
        loop {
            match self.incoming.try_recv() {
                Ok(batch) => received.extend_from_slice(&batch),
                Err(TryRecvError::Empty) => return Ok(received),
                Err(TryRecvError::Disconnected) if received.is_empty() => {
                    let failure = self.reader_error.lock().ok().and_then(|mut slot| slot.take());
                    return Err(failure.map_or(TransportError::Closed, TransportError::Io));
                }
                Err(TryRecvError::Disconnected) => return Ok(received),
            }
        }
    }

    fn attach_waker(&mut self, waker: Waker) {
        if let Ok(mut slot) = self.waker.lock() {
            *slot = Some(waker);
        }
    }
}

fn writer_loop<W: Write>(mut writer: W, rx: Receiver<Vec<u8>>) -> io::Result<()> {
    for batch in rx {
        writer.write_all(&batch)?;
        writer.flush()?;
    }
    Ok(())
}

/// Reads frames until EOF, handing each one, header included, to
/// `on_frame`. Stops early when `on_frame` returns `false`.
fn reader_loop<R, F>(mut reader: R, max_frame_len: usize, mut on_frame: F) -> io::Result<()>
where
    R: Read,
    F: FnMut(Vec<u8>) -> bool,
{
    loop {
        match read_whole_frame(&mut reader, max_frame_len) {
            Ok(Some(frame)) => {
                if !on_frame(frame) {
                    return Ok(());
                }
            }
            Ok(None) => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

/// Returns `Ok(None)` on a clean EOF between frames. EOF inside a frame is
/// an error.
fn read_whole_frame(reader: &mut impl Read, max_frame_len: usize) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0_u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_frame_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("inbound frame of {len} bytes exceeds {max_frame_len}"),
        ));
    }

    let mut frame = vec![0_u8; FRAME_HEADER_LEN + len];
    frame[..FRAME_HEADER_LEN].copy_from_slice(&header);
    reader.read_exact(&mut frame[FRAME_HEADER_LEN..])?;
    Ok(Some(frame))
}
