//! Transport pump for one peer connection.
//!
//! The torrent controller owns every `PeerSession`; what it does not own
//! is a socket. Each connection gets a small tokio task that shuttles raw
//! bytes: socket reads flow up as [`ConnEvent::Data`], write progress is
//! reported byte-for-byte so the session's sent-message accounting stays
//! exact, and the controller steers the task with [`ConnCommand`]s. The
//! pump interprets nothing; all protocol state lives in the session.
use bytes::Buf;
use bytes::Bytes;
use bytes::BytesMut;
use std::net::SocketAddr;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Controller to pump.
#[derive(Debug)]
pub enum ConnCommand {
    /// Append bytes to the pump's write buffer.
    Write(Bytes),
    /// Close the socket and end the task.
    Shutdown,
}

/// Pump to controller.
#[derive(Debug)]
pub enum ConnEvent {
    /// Bytes read off the socket, in arrival order.
    Data(SocketAddr, Bytes),
    /// The socket accepted `n` more outbound bytes.
    Wrote(SocketAddr, usize),
    /// The pump's write buffer ran empty; more may be handed over.
    WriteDrained(SocketAddr),
    /// EOF, connect failure, or a transport error. Terminal.
    Closed(SocketAddr, String),
}

/// Spawns a pump for a connection we initiate. The TCP connect happens
/// inside the task; commands sent before it completes are buffered by the
/// channel, so the controller can enqueue the handshake immediately.
pub fn spawn_outbound(
    addr: SocketAddr,
    events: mpsc::Sender<ConnEvent>,
    read_chunk: usize,
) -> mpsc::Sender<ConnCommand> {
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    tokio::spawn(async move {
        match TcpStream::connect(addr).await {
            Ok(stream) => pump(addr, stream, cmd_rx, events, read_chunk).await,
            Err(e) => {
                let _ = events.send(ConnEvent::Closed(addr, e.to_string())).await;
            }
        }
    });
    cmd_tx
}

/// Spawns a pump for an accepted connection.
pub fn spawn_inbound(
    addr: SocketAddr,
    stream: TcpStream,
    events: mpsc::Sender<ConnEvent>,
    read_chunk: usize,
) -> mpsc::Sender<ConnCommand> {
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    tokio::spawn(async move {
        pump(addr, stream, cmd_rx, events, read_chunk).await;
    });
    cmd_tx
}

/**
The pump loop.

# How it works:
1. Write interest is registered only while the write buffer is non-empty,
   mirroring the session's pending-send signal.
2. A readable socket is drained one chunk per readiness event; the bytes
   go up unparsed.
3. A writable socket takes whatever prefix of the write buffer it will
   accept; the controller learns the exact count so partially-written
   messages are accounted correctly, and a `WriteDrained` notice asks for
   the next chunk once everything handed over has left.
4. Any transport error or EOF produces one final `Closed` event.
*/
async fn pump(
    addr: SocketAddr,
    stream: TcpStream,
    mut commands: mpsc::Receiver<ConnCommand>,
    events: mpsc::Sender<ConnEvent>,
    read_chunk: usize,
) {
    let mut write_buf = BytesMut::new();
    let close_reason: String;

    loop {
        let interest = if write_buf.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };

        tokio::select! {
            command = commands.recv() => match command {
                Some(ConnCommand::Write(bytes)) => {
                    write_buf.extend_from_slice(&bytes);
                }
                Some(ConnCommand::Shutdown) | None => {
                    // Controller-initiated teardown; no Closed event, the
                    // controller already knows.
                    return;
                }
            },
            ready = stream.ready(interest) => {
                let ready = match ready {
                    Ok(ready) => ready,
                    Err(e) => {
                        close_reason = e.to_string();
                        break;
                    }
                };

                if ready.is_readable() {
                    let mut buf = vec![0u8; read_chunk];
                    match stream.try_read(&mut buf) {
                        Ok(0) => {
                            close_reason = "peer closed the connection".to_string();
                            break;
                        }
                        Ok(n) => {
                            buf.truncate(n);
                            if events.send(ConnEvent::Data(addr, buf.into())).await.is_err() {
                                return;
                            }
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(e) => {
                            close_reason = e.to_string();
                            break;
                        }
                    }
                }

                if ready.is_writable() && !write_buf.is_empty() {
                    match stream.try_write(&write_buf) {
                        Ok(n) => {
                            write_buf.advance(n);
                            if events.send(ConnEvent::Wrote(addr, n)).await.is_err() {
                                return;
                            }
                            if write_buf.is_empty()
                                && events
                                    .send(ConnEvent::WriteDrained(addr))
                                    .await
                                    .is_err()
                            {
                                return;
                            }
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(e) => {
                            close_reason = e.to_string();
                            break;
                        }
                    }
                }
            }
        }
    }

    tracing::debug!(%addr, reason = %close_reason, "Connection closed");
    let _ = events.send(ConnEvent::Closed(addr, close_reason)).await;
}
