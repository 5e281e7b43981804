//! Progress reporting out of the engine.
//!
//! One snapshot per tick goes out over the progress channel the embedder
//! supplied at open time, mirroring how storage feedback comes in. Discrete
//! [`EngineEvent`]s ride along inside the snapshot.

use std::net::SocketAddr;

use crate::piece_picker::Priority;

use super::DownloadState;

#[derive(Debug, Clone, Default)]
pub struct DownloadProgress {
    pub tick: usize,
    pub percent: f32,
    pub downloaded: u64,
    pub uploaded: u64,
    pub peers: Vec<PeerStats>,
    pub events: Vec<EngineEvent>,
}

impl DownloadProgress {
    pub fn download_speed(&self) -> u64 {
        self.peers.iter().map(|p| p.download_speed).sum()
    }
}

#[derive(Debug, Clone)]
pub struct PeerStats {
    pub addr: SocketAddr,
    pub downloaded: u64,
    pub uploaded: u64,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub inflight: usize,
    pub fast: bool,
}

/// Discrete things that happened since the last progress dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    PieceVerified(u32),
    PieceFailed {
        piece: u32,
        blame: Vec<SocketAddr>,
    },
    EndgameEntered,
    EndgameExited,
    PeerConnected(SocketAddr),
    PeerDisconnected(SocketAddr),
    FilePriorityChange {
        file: usize,
        priority: Priority,
    },
    PersistenceFailure {
        piece: u32,
        reason: String,
    },
    StateChange(DownloadState),
}
