//! A per-torrent BitTorrent download engine.
//!
//! The engine turns a torrent's metadata into the concurrent download,
//! verification and seeding of its content. It decides which blocks to
//! request from which peers, tracks every outstanding request with
//! per-peer attribution, verifies completed pieces off the hot path and
//! recovers from timeouts, disconnects and digest failures. Peer
//! discovery, encryption and disk I/O stay outside: sessions arrive
//! already negotiated, verified pieces leave through the persistence
//! handle.
//!
//! ```no_run
//! # use torrent_engine::*;
//! # async fn open(params: DownloadParams) -> anyhow::Result<()> {
//! let task_tracker = tokio_util::task::TaskTracker::new();
//! let cancellation_token = tokio_util::sync::CancellationToken::new();
//! let (storage, storage_rx) = MemoryStorage::spawn(&task_tracker, cancellation_token.clone());
//! let (peer_tx, peer_rx) = tokio::sync::mpsc::channel(64);
//! let (progress_tx, progress_rx) = tokio::sync::mpsc::channel(64);
//! let download = Download::new(
//!     params,
//!     Config::default(),
//!     Clock::monotonic(),
//!     storage,
//!     storage_rx,
//!     peer_rx,
//!     progress_tx,
//!     cancellation_token,
//! );
//! let handle = download.start(&task_tracker);
//! # let _ = (handle, peer_tx, progress_rx);
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

mod bitfield;
mod clock;
mod download;
mod info;
mod peers;
mod piece_picker;
mod protocol;
mod scheduler;
mod seeder;
mod storage;
mod swarm;
mod verifier;

pub use bitfield::BitField;
pub use clock::Clock;
pub use download::{
    Block, DataBlock, Download, DownloadHandle, DownloadMessage, DownloadParams, DownloadProgress,
    DownloadState, EngineEvent, PeerKey, PeerStats, StateSnapshot,
};
pub use info::{FileSpan, TorrentInfo};
pub use peers::{PeerConnection, PeerError, PeerErrorKind};
pub use piece_picker::{PieceClass, Priority};
pub use protocol::{Handshake, PeerId};
pub use storage::{MemoryStorage, StorageFeedback, StorageHandle, StorageMessage};
pub use swarm::{BanReason, PeerSource, Swarm, SwarmPeer, SwarmState};

pub const CLIENT_NAME: &str = "torrent-engine 0.1.0";

/// Request/response unit on the wire.
pub const BLOCK_LENGTH: u32 = 16 * 1024;

/// Engine tuning knobs. The defaults are live-swarm tested; individual
/// torrents may override them at open time.
#[derive(Debug, Clone)]
pub struct Config {
    /// Outstanding requests kept per unchoked peer.
    pub pipeline_depth: usize,
    /// Ceiling on concurrently downloading pieces; this bounds buffer
    /// memory, so exceeding it is a configuration error.
    pub max_active_pieces: usize,
    /// Age at which an unanswered request is cancelled and rescheduled.
    pub request_timeout: Duration,
    /// Quiet period after which a piece below the progress bar is
    /// abandoned.
    pub piece_stall_timeout: Duration,
    pub stall_min_progress: f64,
    /// Concurrent requests per block in endgame, 0 for unlimited.
    pub endgame_duplicate_cap: usize,
    /// Download rate that classifies a peer as fast.
    pub fast_peer_threshold_bps: u64,
    /// Digest-blame count that bans a peer from this torrent.
    pub hash_failure_ban_threshold: u32,
    /// Request timeouts tolerated before a peer is dropped.
    pub timeout_strike_threshold: u32,
    pub upload_slots: usize,
    /// Cadence of the core event loop.
    pub tick_interval: Duration,
    /// Cadence of the timeout/stall sweep.
    pub health_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pipeline_depth: 16,
            max_active_pieces: 32,
            request_timeout: Duration::from_secs(30),
            piece_stall_timeout: Duration::from_secs(120),
            stall_min_progress: 0.5,
            endgame_duplicate_cap: 3,
            fast_peer_threshold_bps: 50 * 1024,
            hash_failure_ban_threshold: 3,
            timeout_strike_threshold: 8,
            upload_slots: 8,
            tick_interval: Duration::from_millis(500),
            health_interval: Duration::from_secs(1),
        }
    }
}
