use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::bitfield::BitField;
use crate::protocol::wire::WireMessage;
use crate::protocol::{ExtensionHandshake, PeerId};

use super::{Block, DataBlock, PeerKey};

/// Commands the core sends to a peer's connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    Request(Block),
    Cancel(Block),
    Have { piece: u32 },
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// Outbound block data answering a peer's REQUEST.
    Upload(DataBlock),
}

/// Raw socket byte counters shared between the connection task and the
/// core. Written from I/O completions, read once per tick for speed
/// measurement, hence the release/acquire pairing.
#[derive(Debug, Default)]
pub struct TransferCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl TransferCounters {
    pub fn record_in(&self, bytes: u64) {
        self.bytes_in.fetch_add(bytes, Ordering::Release);
    }

    pub fn record_out(&self, bytes: u64) {
        self.bytes_out.fetch_add(bytes, Ordering::Release);
    }

    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.bytes_in.load(Ordering::Acquire),
            self.bytes_out.load(Ordering::Acquire),
        )
    }
}

/// One choke/interest axis pair.
#[derive(Debug, Clone, Copy)]
pub struct Status {
    choked: bool,
    interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            choked: true,
            interested: false,
        }
    }
}

impl Status {
    pub fn set_choke(&mut self, choked: bool) {
        self.choked = choked;
    }

    pub fn is_choked(&self) -> bool {
        self.choked
    }

    pub fn set_interest(&mut self, interested: bool) {
        self.interested = interested;
    }

    pub fn is_interested(&self) -> bool {
        self.interested
    }
}

/// Per-tick byte deltas over a sliding window, used for the speed readouts
/// and the fast-peer classification.
#[derive(Debug, Default, Clone, Copy)]
pub struct Rates {
    pub downloaded: u64,
    pub uploaded: u64,
}

#[derive(Debug)]
pub struct PerformanceHistory {
    window: VecDeque<Rates>,
    last_snapshot: Rates,
}

impl PerformanceHistory {
    const WINDOW: usize = 20;

    pub fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(Self::WINDOW),
            last_snapshot: Rates::default(),
        }
    }

    /// Feed the cumulative counters once per tick; the stored entry is the
    /// delta since the previous call.
    pub fn update(&mut self, bytes_in: u64, bytes_out: u64) {
        if self.window.len() == Self::WINDOW {
            self.window.pop_back();
        }
        self.window.push_front(Rates {
            downloaded: bytes_in.saturating_sub(self.last_snapshot.downloaded),
            uploaded: bytes_out.saturating_sub(self.last_snapshot.uploaded),
        });
        self.last_snapshot = Rates {
            downloaded: bytes_in,
            uploaded: bytes_out,
        };
    }

    fn avg(&self, pick: impl Fn(&Rates) -> u64) -> u64 {
        if self.window.is_empty() {
            return 0;
        }
        self.window.iter().map(pick).sum::<u64>() / self.window.len() as u64
    }

    pub fn download_speed_bps(&self, tick: Duration) -> u64 {
        (self.avg(|r| r.downloaded) as f64 / tick.as_secs_f64()) as u64
    }

    pub fn upload_speed_bps(&self, tick: Duration) -> u64 {
        (self.avg(|r| r.uploaded) as f64 / tick.as_secs_f64()) as u64
    }
}

impl Default for PerformanceHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Core-side state of a connected peer. The I/O half lives in its own task;
/// the two talk over the bounded flume channels.
#[derive(Debug)]
pub struct ActivePeer {
    pub key: PeerKey,
    pub addr: SocketAddr,
    pub command_tx: flume::Sender<PeerCommand>,
    pub event_rx: flume::Receiver<WireMessage>,
    pub bitfield: BitField,
    pub peer_id: PeerId,
    pub extension_handshake: Option<Box<ExtensionHandshake>>,
    /// Our status towards the peer.
    pub out_status: Status,
    /// The peer's status towards us.
    pub in_status: Status,
    /// Payload bytes accepted from this peer.
    pub downloaded: u64,
    /// Payload bytes served to this peer.
    pub uploaded: u64,
    pub counters: Arc<TransferCounters>,
    pub performance: PerformanceHistory,
    /// Requests in flight. Approximate across choke races; the request
    /// timeout is the backstop.
    pub inflight: usize,
    pub timeout_strikes: u32,
    /// Speed classification, recomputed outside the scheduler each tick.
    pub fast: bool,
    pub cancellation_token: CancellationToken,
}

impl ActivePeer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: PeerKey,
        addr: SocketAddr,
        peer_id: PeerId,
        bitfield: BitField,
        extension_handshake: Option<Box<ExtensionHandshake>>,
        command_tx: flume::Sender<PeerCommand>,
        event_rx: flume::Receiver<WireMessage>,
        counters: Arc<TransferCounters>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            key,
            addr,
            command_tx,
            event_rx,
            bitfield,
            peer_id,
            extension_handshake,
            out_status: Status::default(),
            in_status: Status::default(),
            downloaded: 0,
            uploaded: 0,
            counters,
            performance: PerformanceHistory::new(),
            inflight: 0,
            timeout_strikes: 0,
            fast: false,
            cancellation_token,
        }
    }

    pub fn send(&self, command: PeerCommand) {
        if let Err(e) = self.command_tx.try_send(command) {
            tracing::warn!(peer = %self.addr, "Dropping command to saturated peer channel: {e}");
        }
    }

    pub fn set_out_choke(&mut self, choked: bool) {
        if self.out_status.is_choked() == choked {
            return;
        }
        self.out_status.set_choke(choked);
        self.send(if choked {
            PeerCommand::Choke
        } else {
            PeerCommand::Unchoke
        });
    }

    pub fn set_out_interest(&mut self, interested: bool) {
        if self.out_status.is_interested() == interested {
            return;
        }
        self.out_status.set_interest(interested);
        self.send(if interested {
            PeerCommand::Interested
        } else {
            PeerCommand::NotInterested
        });
    }

    /// How many more requests fit in the pipeline.
    pub fn free_pipeline_slots(&self, depth: usize) -> usize {
        let depth = match self
            .extension_handshake
            .as_ref()
            .and_then(|h| h.request_queue_limit())
        {
            Some(limit) => depth.min(limit),
            None => depth,
        };
        depth.saturating_sub(self.inflight)
    }

    pub fn update_rates(&mut self, tick: Duration, fast_threshold_bps: u64) {
        let (bytes_in, bytes_out) = self.counters.snapshot();
        self.performance.update(bytes_in, bytes_out);
        self.fast = self.performance.download_speed_bps(tick) >= fast_threshold_bps;
    }

    /// Tear the connection down; the task joins through the core's JoinSet.
    pub fn disconnect(&self) {
        self.cancellation_token.cancel();
    }
}
