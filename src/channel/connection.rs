//! Per-channel TCP transport (§4.5): length framing → optional compression
//! → message codec, wired into a read task and a write task joined by an
//! `mpsc` write queue and a `broadcast` exit signal.
//!
//! `tos_common::Connection` (the teacher's own byte-level transport) lives
//! outside this workspace, so this module is built directly on the local
//! `wire::frame`/`wire::compression` primitives instead; the task/queue/
//! exit-broadcast shape is still grounded on `peer_list/peer.rs`'s `Peer`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;

use crate::wire::{frame_codec, Compression};

use super::error::{ChannelError, ChannelResult};
use super::handshake::{
    handle_keepalive_message, HandshakeDriver, HandshakeOutcome, HandshakeState, Keepalive,
};
use super::messages::{Disconnect, DisconnectReason, Hello, Status, TransportMessage};
use super::stats::ChannelStats;

/// Same vocabulary `peer_list/peer.rs` uses for its background task
/// lifecycle, reused here for the read/write tasks of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Inactive,
    Active,
    Exiting,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

pub const WRITE_QUEUE_DEPTH: usize = 256;
pub const APP_QUEUE_DEPTH: usize = 256;

type FramedStream = Framed<TcpStream, tokio_util::codec::LengthDelimitedCodec>;

/// Application-facing handle to an active channel.
pub struct Channel {
    pub remote_endpoint: SocketAddr,
    pub direction: Direction,
    stats: Arc<ChannelStats>,
    write_tx: mpsc::Sender<TransportMessage>,
    exit_tx: broadcast::Sender<()>,
    active: Arc<AtomicBool>,
    fail_count: Arc<AtomicU8>,
}

impl Channel {
    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn fail_count(&self) -> u8 {
        self.fail_count.load(Ordering::Relaxed)
    }

    pub async fn send_app(&self, payload: Vec<u8>) -> ChannelResult<()> {
        self.write_tx
            .send(TransportMessage::AppTest(payload))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Ask the channel to close; the write task sends `DISCONNECT` best
    /// effort before the socket is torn down.
    pub fn close(&self, reason: DisconnectReason) {
        let _ = self.write_tx.try_send(TransportMessage::Disconnect(Disconnect { reason }));
        let _ = self.exit_tx.send(());
        self.active.store(false, Ordering::Relaxed);
    }
}

async fn write_frame(
    sink: &mut futures::stream::SplitSink<FramedStream, Bytes>,
    compression: &Option<Arc<Compression>>,
    message: &TransportMessage,
    stats: &ChannelStats,
) -> ChannelResult<()> {
    let body = message.encode();
    let framed_body = match compression {
        Some(c) => c.encode(&body).await?,
        None => body,
    };
    let len = framed_body.len();
    sink.send(Bytes::from(framed_body))
        .await
        .map_err(|e| ChannelError::Frame(e.to_string()))?;
    stats.record_sent(len);
    Ok(())
}

async fn read_message(
    source: &mut futures::stream::SplitStream<FramedStream>,
    compression: &Option<Arc<Compression>>,
    stats: &ChannelStats,
) -> ChannelResult<TransportMessage> {
    let frame = source
        .next()
        .await
        .ok_or(ChannelError::Closed)?
        .map_err(|e| ChannelError::Frame(e.to_string()))?;
    let body = match compression {
        Some(c) => c.decode(&frame).await?,
        None => frame.to_vec(),
    };
    stats.record_received(frame.len());
    TransportMessage::decode(&body).map_err(ChannelError::Codec)
}

/// Drives the handshake to completion over `stream`, then spawns the
/// steady-state read/write tasks and returns the application-facing
/// `Channel` handle plus a receiver of decoded `APP_TEST` payloads.
pub async fn spawn(
    stream: TcpStream,
    remote_endpoint: SocketAddr,
    direction: Direction,
    local_hello: Hello,
    local_status: Status,
    max_frame: usize,
    compression: Option<Arc<Compression>>,
) -> ChannelResult<(Channel, mpsc::Receiver<Vec<u8>>)> {
    let framed: FramedStream = Framed::new(stream, frame_codec(max_frame));
    let (mut sink, mut source) = framed.split();

    let stats = Arc::new(ChannelStats::new());
    let mut driver = match direction {
        Direction::Outbound => HandshakeDriver::new_outbound(local_hello, local_status),
        Direction::Inbound => HandshakeDriver::new_inbound(local_hello, local_status),
    };

    if let Some(initial) = driver.initial_send() {
        write_frame(&mut sink, &compression, &initial, &stats).await?;
    }

    while driver.state() != HandshakeState::Active {
        let message = read_message(&mut source, &compression, &stats).await?;
        match driver.on_message(message)? {
            HandshakeOutcome::Send(sends) => {
                for reply in sends {
                    write_frame(&mut sink, &compression, &reply, &stats).await?;
                }
            }
            HandshakeOutcome::Done => break,
            HandshakeOutcome::Reject(reason) => {
                let _ = write_frame(
                    &mut sink,
                    &compression,
                    &TransportMessage::Disconnect(Disconnect { reason }),
                    &stats,
                )
                .await;
                return Err(reject_to_error(reason));
            }
        }
    }
    debug!("handshake complete with {remote_endpoint}");

    let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
    let (app_tx, app_rx) = mpsc::channel(APP_QUEUE_DEPTH);
    let (exit_tx, _) = broadcast::channel(4);
    let active = Arc::new(AtomicBool::new(true));
    let fail_count = Arc::new(AtomicU8::new(0));

    tokio::spawn(write_task(
        sink,
        compression.clone(),
        write_rx,
        exit_tx.subscribe(),
        stats.clone(),
    ));
    tokio::spawn(read_task(
        source,
        compression,
        app_tx,
        write_tx.clone(),
        exit_tx.subscribe(),
        stats.clone(),
        active.clone(),
        fail_count.clone(),
        remote_endpoint,
    ));

    Ok((
        Channel {
            remote_endpoint,
            direction,
            stats,
            write_tx,
            exit_tx,
            active,
            fail_count,
        },
        app_rx,
    ))
}

fn reject_to_error(reason: DisconnectReason) -> ChannelError {
    match reason {
        DisconnectReason::Incompatible => ChannelError::Incompatible(0, 0),
        DisconnectReason::BadProtocol => ChannelError::ProtocolViolation("bad protocol during handshake".into()),
        other => ChannelError::ProtocolViolation(format!("{other:?}")),
    }
}

async fn write_task(
    mut sink: futures::stream::SplitSink<FramedStream, Bytes>,
    compression: Option<Arc<Compression>>,
    mut write_rx: mpsc::Receiver<TransportMessage>,
    mut exit_rx: broadcast::Receiver<()>,
    stats: Arc<ChannelStats>,
) {
    loop {
        tokio::select! {
            message = write_rx.recv() => {
                match message {
                    Some(message) => {
                        if let Err(e) = write_frame(&mut sink, &compression, &message, &stats).await {
                            warn!("write task closing after error: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = exit_rx.recv() => break,
        }
    }
    let _ = sink.close().await;
}

/// Read task: decodes frames, answers keepalive, feeds `APP_TEST` payloads
/// to the dispatcher, and re-queues outbound `PONG`/keepalive traffic via
/// `write_tx`. Malformed frames close the channel per §7.
#[allow(clippy::too_many_arguments)]
async fn read_task(
    mut source: futures::stream::SplitStream<FramedStream>,
    compression: Option<Arc<Compression>>,
    app_tx: mpsc::Sender<Vec<u8>>,
    write_tx: mpsc::Sender<TransportMessage>,
    mut exit_rx: broadcast::Receiver<()>,
    stats: Arc<ChannelStats>,
    active: Arc<AtomicBool>,
    fail_count: Arc<AtomicU8>,
    remote_endpoint: SocketAddr,
) {
    let mut keepalive = Keepalive::default();
    let mut ticker = tokio::time::interval(super::handshake::DEFAULT_IDLE_READ / 2);

    loop {
        tokio::select! {
            frame = read_message(&mut source, &compression, &stats) => {
                match frame {
                    Ok(message) => {
                        keepalive.on_recv();
                        if let Some(reply) = handle_keepalive_message(&message) {
                            let _ = write_tx.send(reply).await;
                            continue;
                        }
                        match message {
                            TransportMessage::AppTest(payload) => {
                                let _ = app_tx.send(payload).await;
                            }
                            TransportMessage::Disconnect(_) => {
                                debug!("peer {remote_endpoint} sent DISCONNECT");
                                break;
                            }
                            _ => {}
                        }
                    }
                    Err(ChannelError::Closed) => break,
                    Err(e @ ChannelError::Codec(_)) => {
                        warn!("malformed frame from {remote_endpoint}: {e}");
                        fail_count.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    Err(e) => {
                        trace!("channel with {remote_endpoint} closing: {e}");
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                match keepalive.on_tick(std::time::Instant::now()) {
                    super::handshake::KeepaliveAction::SendPing => {
                        let _ = write_tx.send(TransportMessage::Ping).await;
                    }
                    super::handshake::KeepaliveAction::Timeout => {
                        fail_count.fetch_add(1, Ordering::Relaxed);
                        debug!("channel with {remote_endpoint} timed out");
                        break;
                    }
                    super::handshake::KeepaliveAction::None => {}
                }
            }
            _ = exit_rx.recv() => break,
        }
    }
    active.store(false, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeId;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    fn hello() -> Hello {
        Hello {
            network_id: 7,
            network_version: 1,
            peer_descriptor: crate::identity::Node::new(
                Some(NodeId::new([2u8; 20])),
                Some(Ipv4Addr::new(127, 0, 0, 1)),
                None,
                30303,
                7,
                1,
            )
            .unwrap(),
        }
    }

    #[tokio::test]
    async fn handshake_completes_over_loopback_and_app_test_roundtrips() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, peer_addr) = listener.accept().await.unwrap();
            spawn(
                stream,
                peer_addr,
                Direction::Inbound,
                hello(),
                Status { app_data: vec![] },
                64 * 1024,
                None,
            )
            .await
            .unwrap()
        });

        let client_stream = TcpStream::connect(addr).await.unwrap();
        let (client_channel, _client_app_rx) = spawn(
            client_stream,
            addr,
            Direction::Outbound,
            hello(),
            Status { app_data: vec![] },
            64 * 1024,
            None,
        )
        .await
        .unwrap();

        let (server_channel, mut server_app_rx) = server.await.unwrap();
        assert!(client_channel.is_active());
        assert!(server_channel.is_active());

        client_channel.send_app(vec![1, 2, 3]).await.unwrap();
        let received = tokio::time::timeout(std::time::Duration::from_secs(2), server_app_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, vec![1, 2, 3]);
    }
}
