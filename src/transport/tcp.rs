use crate::error::{RecvError, TryRecvError, WriteError};
use crate::protocol::codec::{decode_frame, encode_frame};
use crate::protocol::{Event, EventKind};
use crate::transport::{ClientStream, EventDuplex, StreamAcceptor};
use crate::utils::StopToken;
use anyhow::Context;
use bytes::BytesMut;
use crossbeam::channel as cbchan;
use std::net::SocketAddr;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Builder;
use tokio::task::LocalSet;
use tokio::time::sleep;

/// How often a connection task drains its outbound queue to the socket.
const OUTBOUND_POLL: Duration = Duration::from_millis(1);
/// How often the acceptor re-checks its stop token.
const ACCEPT_TICK: Duration = Duration::from_millis(50);

const READ_BUF: usize = 8 * 1024;

/// Handle to the TCP acceptor runner thread.
pub struct TcpAcceptorHandle {
    local_addr: SocketAddr,
    join: Option<JoinHandle<()>>,
}

impl TcpAcceptorHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn join(mut self) -> anyhow::Result<()> {
        if let Some(join) = self.join.take()
            && join.join().is_err()
        {
            anyhow::bail!("tcp acceptor thread panicked");
        }
        Ok(())
    }
}

/// Bind `addr` and bridge framed TCP connections onto the server's
/// event queue. Runs a current-thread runtime plus a `LocalSet` on a
/// dedicated thread, with one local task per connection.
pub fn spawn_acceptor(
    addr: &str,
    acceptor: StreamAcceptor,
    stop: StopToken,
) -> anyhow::Result<TcpAcceptorHandle> {
    let listener =
        std::net::TcpListener::bind(addr).with_context(|| format!("failed to bind {addr}"))?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;

    let join = thread::spawn(move || {
        let rt = match Builder::new_current_thread().enable_io().enable_time().build() {
            Ok(rt) => rt,
            Err(e) => {
                tracing::error!("[TcpTransport] tokio runtime build failed: {e}");
                return;
            }
        };
        let local = LocalSet::new();
        rt.block_on(local.run_until(async move {
            let listener = match tokio::net::TcpListener::from_std(listener) {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::error!("[TcpTransport] listener registration failed: {e}");
                    return;
                }
            };
            tracing::info!("[TcpTransport] listening on {local_addr}");

            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((socket, peer)) => {
                            let stream = match acceptor.connect() {
                                Ok(stream) => stream,
                                Err(e) => {
                                    tracing::warn!("[TcpTransport] refusing {peer}: {e}");
                                    continue;
                                }
                            };
                            tracing::debug!(
                                "[TcpTransport] {peer} attached as stream {}",
                                stream.stream_id()
                            );
                            let _ = socket.set_nodelay(true);
                            tokio::task::spawn_local(run_connection(socket, stream, stop.child()));
                        }
                        Err(e) => {
                            tracing::warn!("[TcpTransport] accept failed: {e}");
                            sleep(ACCEPT_TICK).await;
                        }
                    },
                    _ = sleep(ACCEPT_TICK) => {
                        if stop.is_stopped() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("[TcpTransport] acceptor stopped");
        }));
    });

    Ok(TcpAcceptorHandle {
        local_addr,
        join: Some(join),
    })
}

/// Pump one accepted socket: inbound frames go to the server queue,
/// outbound envelopes drain to the socket on a short poll. Dropping
/// the bridged `ClientStream` delivers the disconnect cascade.
async fn run_connection(mut socket: tokio::net::TcpStream, mut stream: ClientStream, stop: StopToken) {
    let mut buf = BytesMut::with_capacity(READ_BUF);

    loop {
        if stop.is_killed() {
            return;
        }
        tokio::select! {
            read = socket.read_buf(&mut buf) => match read {
                Ok(0) => return,
                Ok(_) => loop {
                    match decode_frame(&mut buf) {
                        Ok(Some(event)) => {
                            if stream.send(event).is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(
                                "[TcpTransport] bad frame on stream {}: {e}",
                                stream.stream_id()
                            );
                            return;
                        }
                    }
                },
                Err(e) => {
                    tracing::debug!(
                        "[TcpTransport] read error on stream {}: {e}",
                        stream.stream_id()
                    );
                    return;
                }
            },
            _ = sleep(OUTBOUND_POLL) => {
                loop {
                    match stream.try_recv() {
                        Ok(event) => {
                            let frame = match encode_frame(&event) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    tracing::warn!(
                                        "[TcpTransport] encode failed on stream {}: {e}",
                                        stream.stream_id()
                                    );
                                    continue;
                                }
                            };
                            if socket.write_all(&frame).await.is_err() {
                                return;
                            }
                        }
                        Err(TryRecvError::Empty) => break,
                        // server dropped our writer; the stream is gone
                        Err(TryRecvError::Disconnected) => return,
                    }
                }
                if stop.is_stopped() {
                    return;
                }
            }
        }
    }
}

/// Client side of a framed TCP stream. Presents the same duplex
/// surface as the in-process stream, bridged by its own runner thread.
pub struct TcpClientStream {
    out_tx: cbchan::Sender<Event>,
    in_rx: cbchan::Receiver<Event>,
    stop: StopToken,
    join: Option<JoinHandle<()>>,
}

pub fn dial(addr: &str) -> anyhow::Result<TcpClientStream> {
    let socket =
        std::net::TcpStream::connect(addr).with_context(|| format!("failed to dial {addr}"))?;
    socket.set_nonblocking(true)?;
    let _ = socket.set_nodelay(true);

    let (out_tx, out_rx) = cbchan::bounded::<Event>(256);
    let (in_tx, in_rx) = cbchan::unbounded::<Event>();
    let stop = StopToken::new_root();
    let bridge_stop = stop.child();

    let join = thread::spawn(move || {
        let rt = match Builder::new_current_thread().enable_io().enable_time().build() {
            Ok(rt) => rt,
            Err(e) => {
                tracing::error!("[TcpTransport] tokio runtime build failed: {e}");
                return;
            }
        };
        let local = LocalSet::new();
        rt.block_on(local.run_until(async move {
            let mut socket = match tokio::net::TcpStream::from_std(socket) {
                Ok(socket) => socket,
                Err(e) => {
                    tracing::error!("[TcpTransport] socket registration failed: {e}");
                    return;
                }
            };
            let mut buf = BytesMut::with_capacity(READ_BUF);

            loop {
                if bridge_stop.is_killed() {
                    return;
                }
                tokio::select! {
                    read = socket.read_buf(&mut buf) => match read {
                        Ok(0) => return,
                        Ok(_) => loop {
                            match decode_frame(&mut buf) {
                                Ok(Some(event)) => {
                                    if in_tx.send(event).is_err() {
                                        return;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    tracing::warn!("[TcpTransport] bad frame from server: {e}");
                                    return;
                                }
                            }
                        },
                        Err(e) => {
                            tracing::debug!("[TcpTransport] read error: {e}");
                            return;
                        }
                    },
                    _ = sleep(OUTBOUND_POLL) => {
                        while let Ok(event) = out_rx.try_recv() {
                            let disconnecting = event.kind == EventKind::Disconnect;
                            match encode_frame(&event) {
                                Ok(frame) => {
                                    if socket.write_all(&frame).await.is_err() {
                                        return;
                                    }
                                }
                                Err(e) => tracing::warn!("[TcpTransport] encode failed: {e}"),
                            }
                            if disconnecting {
                                let _ = socket.flush().await;
                                return;
                            }
                        }
                        if bridge_stop.is_stopped() {
                            return;
                        }
                    }
                }
            }
        }));
    });

    Ok(TcpClientStream {
        out_tx,
        in_rx,
        stop,
        join: Some(join),
    })
}

impl EventDuplex for TcpClientStream {
    fn send(&mut self, event: Event) -> Result<(), WriteError> {
        self.out_tx.send(event).map_err(|_| WriteError::Closed)
    }

    fn try_recv(&mut self) -> Result<Event, TryRecvError> {
        match self.in_rx.try_recv() {
            Ok(event) => Ok(event),
            Err(cbchan::TryRecvError::Empty) => Err(TryRecvError::Empty),
            Err(cbchan::TryRecvError::Disconnected) => Err(TryRecvError::Disconnected),
        }
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Event, RecvError> {
        match self.in_rx.recv_timeout(timeout) {
            Ok(event) => Ok(event),
            Err(cbchan::RecvTimeoutError::Timeout) => Err(RecvError::Timeout),
            Err(cbchan::RecvTimeoutError::Disconnected) => Err(RecvError::Disconnected),
        }
    }

    /// Tell the server to drop this stream, then wait for the bridge
    /// thread to flush the disconnect frame and exit.
    fn disconnect(mut self) {
        let _ = self.out_tx.send(Event::disconnect());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        self.stop.stop();
    }
}

impl Drop for TcpClientStream {
    fn drop(&mut self) {
        let _ = self.out_tx.try_send(Event::disconnect());
        self.stop.stop();
    }
}
