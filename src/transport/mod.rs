use crate::error::{RecvError, TryRecvError, WriteError};
use crate::protocol::{Event, StreamId};
use crate::utils::StopToken;
use crossbeam::channel as cbchan;
use crossbeam::utils::Backoff;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

pub mod tcp;

/// Writer half of one client stream.
///
/// Held by the server registry and cloned into diffusion paths. The
/// bounded queue is the backpressure contract: `write` backs off up to
/// the configured patience, after which the write counts as failed and
/// the stream is torn down by the caller.
#[derive(Clone)]
pub struct EventWriter {
    stream_id: StreamId,
    tx: cbchan::Sender<Event>,
    patience: Duration,
}

impl EventWriter {
    /// Build a writer plus the receiver feeding the other end of the
    /// stream. Used by acceptors and directly by unit tests.
    pub fn pair(
        stream_id: StreamId,
        capacity: usize,
        patience: Duration,
    ) -> (EventWriter, cbchan::Receiver<Event>) {
        let (tx, rx) = cbchan::bounded(capacity);
        (
            EventWriter {
                stream_id,
                tx,
                patience,
            },
            rx,
        )
    }

    #[inline]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Non-blocking write.
    pub fn try_write(&self, event: Event) -> Result<(), WriteError> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(cbchan::TrySendError::Full(_)) => Err(WriteError::Full),
            Err(cbchan::TrySendError::Disconnected(_)) => Err(WriteError::Closed),
        }
    }

    /// Backpressured write: spin, snooze, then sleep until the queue
    /// accepts the envelope or patience runs out.
    pub fn write(&self, event: Event, stop: &StopToken) -> Result<(), WriteError> {
        let start = Instant::now();
        let backoff = Backoff::new();
        let mut event = event;

        loop {
            if stop.is_killed() {
                return Err(WriteError::Stopped);
            }
            match self.tx.try_send(event) {
                Ok(()) => return Ok(()),
                Err(cbchan::TrySendError::Disconnected(_)) => return Err(WriteError::Closed),
                Err(cbchan::TrySendError::Full(back)) => {
                    if start.elapsed() >= self.patience {
                        return Err(WriteError::Full);
                    }
                    event = back;
                    if backoff.is_completed() {
                        thread::sleep(Duration::from_micros(50));
                    } else {
                        backoff.snooze();
                    }
                }
            }
        }
    }
}

/// Events the server loop consumes. Transports push these into the
/// single queue; per-stream ordering follows the queue FIFO.
#[derive(Debug)]
pub enum ServerEvent {
    /// New stream attached; `writer` delivers server → client envelopes.
    Connected {
        stream_id: StreamId,
        writer: EventWriter,
    },
    /// Envelope received from a client stream.
    Inbound { stream_id: StreamId, event: Event },
    /// Ask the scheduler for a coalesced update tick.
    RequestUpdate,
    /// Wake the loop so it re-checks its stop token.
    Wake,
}

impl std::fmt::Debug for EventWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventWriter")
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

/// Bidirectional typed event stream, as seen by a client.
///
/// The two concrete transports (in-process channels, framed TCP) both
/// present this surface to [`crate::client::ControlPlaneClient`].
pub trait EventDuplex: Send {
    fn send(&mut self, event: Event) -> Result<(), WriteError>;
    fn try_recv(&mut self) -> Result<Event, TryRecvError>;
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Event, RecvError>;

    /// Tear the stream down, telling the server to drop its state.
    fn disconnect(self)
    where
        Self: Sized;
}

/// Client half of an in-process stream pair.
///
/// Dropping the stream without an explicit `disconnect` still delivers
/// the disconnect envelope so the server can run its cascade.
pub struct ClientStream {
    stream_id: StreamId,
    to_server: cbchan::Sender<ServerEvent>,
    inbox: cbchan::Receiver<Event>,
    disconnected: bool,
}

impl ClientStream {
    #[inline]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    fn send_disconnect(&mut self) {
        if !self.disconnected {
            self.disconnected = true;
            let _ = self.to_server.send(ServerEvent::Inbound {
                stream_id: self.stream_id,
                event: Event::disconnect(),
            });
        }
    }
}

impl EventDuplex for ClientStream {
    fn send(&mut self, event: Event) -> Result<(), WriteError> {
        self.to_server
            .send(ServerEvent::Inbound {
                stream_id: self.stream_id,
                event,
            })
            .map_err(|_| WriteError::Closed)
    }

    fn try_recv(&mut self) -> Result<Event, TryRecvError> {
        match self.inbox.try_recv() {
            Ok(event) => Ok(event),
            Err(cbchan::TryRecvError::Empty) => Err(TryRecvError::Empty),
            Err(cbchan::TryRecvError::Disconnected) => Err(TryRecvError::Disconnected),
        }
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Event, RecvError> {
        match self.inbox.recv_timeout(timeout) {
            Ok(event) => Ok(event),
            Err(cbchan::RecvTimeoutError::Timeout) => Err(RecvError::Timeout),
            Err(cbchan::RecvTimeoutError::Disconnected) => Err(RecvError::Disconnected),
        }
    }

    fn disconnect(mut self) {
        self.send_disconnect();
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        self.send_disconnect();
    }
}

/// Accept-side factory handed out by the server. Cloned freely by
/// transports; each `connect` mints a stream id and announces the new
/// stream on the server queue.
#[derive(Clone)]
pub struct StreamAcceptor {
    queue: cbchan::Sender<ServerEvent>,
    next_stream_id: Arc<AtomicU64>,
    stop: StopToken,
    stream_buffer: usize,
    write_patience: Duration,
}

impl StreamAcceptor {
    pub(crate) fn new(
        queue: cbchan::Sender<ServerEvent>,
        stop: StopToken,
        stream_buffer: usize,
        write_patience: Duration,
    ) -> Self {
        Self {
            queue,
            next_stream_id: Arc::new(AtomicU64::new(1)),
            stop,
            stream_buffer,
            write_patience,
        }
    }

    /// Attach a new in-process stream. Fails once the server is
    /// stopping or its queue is gone.
    pub fn connect(&self) -> Result<ClientStream, WriteError> {
        if self.stop.is_stopped() {
            return Err(WriteError::Closed);
        }
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (writer, inbox) = EventWriter::pair(stream_id, self.stream_buffer, self.write_patience);
        self.queue
            .send(ServerEvent::Connected { stream_id, writer })
            .map_err(|_| WriteError::Closed)?;
        Ok(ClientStream {
            stream_id,
            to_server: self.queue.clone(),
            inbox,
            disconnected: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Ack, Message};

    #[test]
    fn write_fails_full_after_patience() {
        let (writer, _rx) = EventWriter::pair(1, 1, Duration::from_millis(10));
        writer.try_write(Event::disconnect()).unwrap();

        let stop = StopToken::new_root();
        let err = writer
            .write(Event::response(1, Message::Ack(Ack)), &stop)
            .unwrap_err();
        assert_eq!(err, WriteError::Full);
    }

    #[test]
    fn write_fails_closed_when_reader_gone() {
        let (writer, rx) = EventWriter::pair(1, 4, Duration::from_millis(10));
        drop(rx);
        assert_eq!(writer.try_write(Event::disconnect()), Err(WriteError::Closed));
    }

    #[test]
    fn kill_interrupts_backpressured_write() {
        let (writer, _rx) = EventWriter::pair(1, 1, Duration::from_secs(5));
        writer.try_write(Event::disconnect()).unwrap();

        let stop = StopToken::new_root();
        stop.kill();
        let err = writer
            .write(Event::response(1, Message::Ack(Ack)), &stop)
            .unwrap_err();
        assert_eq!(err, WriteError::Stopped);
    }

    #[test]
    fn dropping_client_stream_emits_disconnect() {
        let (queue_tx, queue_rx) = cbchan::unbounded();
        let acceptor = StreamAcceptor::new(
            queue_tx,
            StopToken::new_root(),
            8,
            Duration::from_millis(10),
        );

        let stream = acceptor.connect().expect("connect");
        let stream_id = stream.stream_id();
        drop(stream);

        match queue_rx.try_recv().expect("connected event") {
            ServerEvent::Connected { stream_id: id, .. } => assert_eq!(id, stream_id),
            other => panic!("unexpected event: {other:?}"),
        }
        match queue_rx.try_recv().expect("disconnect event") {
            ServerEvent::Inbound { stream_id: id, event } => {
                assert_eq!(id, stream_id);
                assert_eq!(event.kind, crate::protocol::EventKind::Disconnect);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
