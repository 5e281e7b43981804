//! The I/O half of a peer session.
//!
//! [`PeerConnection::establish`] performs the handshake and bitfield
//! exchange on a fresh socket; [`PeerConnection::run`] is the steady-state
//! loop that shuttles decoded messages to the core and writes the core's
//! commands back out. The core never touches the socket.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_stream::StreamExt;
use tokio_util::codec::{Encoder, Framed};
use tokio_util::sync::CancellationToken;

use crate::bitfield::BitField;
use crate::download::peer::{PeerCommand, TransferCounters};
use crate::download::{DataBlock, PEER_IN_CHANNEL_CAPACITY};
use crate::protocol::wire::{MessageCodec, WireMessage};
use crate::protocol::{ExtensionHandshake, Handshake, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerErrorKind {
    Timeout,
    Connection,
    Protocol,
}

#[derive(Debug, Clone)]
pub struct PeerError {
    pub kind: PeerErrorKind,
    pub msg: String,
}

impl PeerError {
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self {
            kind: PeerErrorKind::Timeout,
            msg: msg.into(),
        }
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self {
            kind: PeerErrorKind::Connection,
            msg: msg.into(),
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self {
            kind: PeerErrorKind::Protocol,
            msg: msg.into(),
        }
    }
}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} peer error: {}", self.kind, self.msg)
    }
}

impl std::error::Error for PeerError {}

/// Channel pair binding a connection task to the core.
#[derive(Debug)]
pub struct PeerIPC {
    pub event_tx: flume::Sender<WireMessage>,
    pub command_rx: flume::Receiver<PeerCommand>,
}

const ESTABLISH_STEP_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(100);
const IDLE_DISCONNECT: Duration = Duration::from_secs(180);

#[derive(Debug)]
pub struct PeerConnection {
    addr: SocketAddr,
    handshake: Handshake,
    extension_handshake: Option<Box<ExtensionHandshake>>,
    bitfield: BitField,
    stream: Framed<TcpStream, MessageCodec>,
    /// Messages that arrived during establishment, replayed before the
    /// select loop so nothing the transport buffered is lost.
    buffered: VecDeque<WireMessage>,
    counters: Arc<TransferCounters>,
    write_buf: BytesMut,
}

impl PeerConnection {
    /// Handshakes a fresh socket: preamble exchange, our bitfield out, the
    /// peer's bitfield (if any) in, extension handshake when both sides
    /// advertise it.
    pub async fn establish(
        mut socket: TcpStream,
        info_hash: [u8; 20],
        local_id: PeerId,
        our_bitfield: &BitField,
    ) -> anyhow::Result<Self> {
        let addr = socket.peer_addr().context("peer address")?;
        let ours = Handshake::new(info_hash, local_id);
        socket
            .write_all(&ours.to_bytes())
            .await
            .context("send handshake")?;

        let mut raw = [0u8; Handshake::LENGTH];
        socket.read_exact(&mut raw).await.context("read handshake")?;
        let theirs = Handshake::from_bytes(&raw)?;
        anyhow::ensure!(
            theirs.info_hash == info_hash,
            "peer {addr} answered for a different torrent",
        );

        let mut this = Self {
            addr,
            handshake: theirs,
            extension_handshake: None,
            bitfield: BitField::new(our_bitfield.len()),
            stream: Framed::new(socket, MessageCodec),
            buffered: VecDeque::new(),
            counters: Arc::new(TransferCounters::default()),
            write_buf: BytesMut::new(),
        };

        this.send_message(WireMessage::Bitfield {
            raw: Bytes::copy_from_slice(our_bitfield.as_bytes()),
        })
        .await
        .context("send bitfield")?;
        let supports_extensions =
            ours.supports_extensions() && this.handshake.supports_extensions();
        if supports_extensions {
            this.send_message(WireMessage::ExtensionHandshake {
                payload: ExtensionHandshake::ours(PEER_IN_CHANNEL_CAPACITY),
            })
            .await
            .context("send extension handshake")?;
        }

        // Pull whatever the peer leads with. A bitfield must come first if
        // it comes at all; the extension handshake may land either side of
        // it. Anything else is buffered for the run loop, so no deferred
        // delivery tricks are needed around the transport.
        let preamble_messages = if supports_extensions { 2 } else { 1 };
        let mut saw_bitfield = false;
        for _ in 0..preamble_messages {
            let Ok(next) = tokio::time::timeout(ESTABLISH_STEP_TIMEOUT, this.stream.next()).await
            else {
                break;
            };
            match next.transpose()? {
                Some(WireMessage::Bitfield { raw }) if !saw_bitfield => {
                    this.bitfield =
                        BitField::from_wire(&raw, our_bitfield.len()).context("peer bitfield")?;
                    saw_bitfield = true;
                }
                Some(WireMessage::ExtensionHandshake { payload })
                    if supports_extensions && this.extension_handshake.is_none() =>
                {
                    this.extension_handshake = Some(Box::new(payload));
                }
                Some(other) => {
                    this.buffered.push_back(other);
                    break;
                }
                None => anyhow::bail!("peer {addr} closed during establishment"),
            }
        }

        Ok(this)
    }

    pub async fn connect(
        addr: SocketAddr,
        info_hash: [u8; 20],
        local_id: PeerId,
        our_bitfield: &BitField,
    ) -> anyhow::Result<Self> {
        let socket = TcpStream::connect(addr).await.context("dial peer")?;
        Self::establish(socket, info_hash, local_id, our_bitfield).await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn peer_id(&self) -> PeerId {
        self.handshake.peer_id
    }

    pub fn bitfield(&self) -> &BitField {
        &self.bitfield
    }

    pub fn extension_handshake(&self) -> Option<&ExtensionHandshake> {
        self.extension_handshake.as_deref()
    }

    pub fn counters(&self) -> Arc<TransferCounters> {
        self.counters.clone()
    }

    /// Steady-state loop until cancellation, socket close or a protocol
    /// error. Buffered establishment messages drain first, then the task
    /// multiplexes core commands with socket traffic.
    pub async fn run(mut self, ipc: PeerIPC, token: CancellationToken) -> Result<(), PeerError> {
        while let Some(msg) = self.buffered.pop_front() {
            if ipc.event_tx.send_async(msg).await.is_err() {
                return Ok(());
            }
        }

        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.tick().await;
        let idle_deadline = tokio::time::sleep(IDLE_DISCONNECT);
        tokio::pin!(idle_deadline);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    return Ok(());
                }
                _ = keepalive.tick() => {
                    self.send_message(WireMessage::KeepAlive)
                        .await
                        .map_err(|e| PeerError::connection(format!("keepalive: {e}")))?;
                }
                _ = &mut idle_deadline => {
                    return Err(PeerError::timeout("peer went silent"));
                }
                command = ipc.command_rx.recv_async() => {
                    let Ok(command) = command else {
                        // the core dropped us
                        return Ok(());
                    };
                    self.send_command(command).await?;
                    // drain whatever else the core queued in this tick
                    while let Ok(command) = ipc.command_rx.try_recv() {
                        self.send_command(command).await?;
                    }
                }
                incoming = self.stream.next() => {
                    let msg = match incoming {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            return Err(PeerError::protocol(format!("bad frame: {e}")));
                        }
                        None => {
                            return Err(PeerError::connection("peer closed the socket"));
                        }
                    };
                    idle_deadline
                        .as_mut()
                        .reset(tokio::time::Instant::now() + IDLE_DISCONNECT);
                    self.counters.record_in(wire_cost(&msg));
                    tracing::trace!(peer = %self.addr, %msg, "Received message");
                    if ipc.event_tx.send_async(msg).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn send_command(&mut self, command: PeerCommand) -> Result<(), PeerError> {
        self.send_message(command_to_message(command))
            .await
            .map_err(|e| PeerError::connection(format!("send failed: {e}")))
    }

    /// Frames the message into the scratch buffer and writes it through the
    /// underlying socket, the codec's encoder doing the length prefixing.
    async fn send_message(&mut self, msg: WireMessage) -> anyhow::Result<()> {
        self.counters.record_out(wire_cost(&msg));
        self.write_buf.clear();
        MessageCodec.encode(msg, &mut self.write_buf)?;
        self.stream.get_mut().write_all(&self.write_buf).await?;
        Ok(())
    }
}

fn command_to_message(command: PeerCommand) -> WireMessage {
    match command {
        PeerCommand::Request(block) => WireMessage::Request {
            piece: block.piece,
            begin: block.offset,
            length: block.length,
        },
        PeerCommand::Cancel(block) => WireMessage::Cancel {
            piece: block.piece,
            begin: block.offset,
            length: block.length,
        },
        PeerCommand::Have { piece } => WireMessage::Have { piece },
        PeerCommand::Choke => WireMessage::Choke,
        PeerCommand::Unchoke => WireMessage::Unchoke,
        PeerCommand::Interested => WireMessage::Interested,
        PeerCommand::NotInterested => WireMessage::NotInterested,
        PeerCommand::Upload(DataBlock {
            piece,
            offset,
            data,
        }) => WireMessage::Piece {
            piece,
            begin: offset,
            data,
        },
    }
}

/// Approximate bytes a message occupies on the wire, feeding the shared
/// rate counters.
fn wire_cost(msg: &WireMessage) -> u64 {
    5 + match msg {
        WireMessage::KeepAlive
        | WireMessage::Choke
        | WireMessage::Unchoke
        | WireMessage::Interested
        | WireMessage::NotInterested => 0,
        WireMessage::Have { .. } => 4,
        WireMessage::Bitfield { raw } => raw.len() as u64,
        WireMessage::Request { .. } | WireMessage::Cancel { .. } => 12,
        WireMessage::Piece { data, .. } => 8 + data.len() as u64,
        WireMessage::ExtensionHandshake { .. } => 64,
        WireMessage::Extension { payload, .. } => 1 + payload.len() as u64,
    }
}
