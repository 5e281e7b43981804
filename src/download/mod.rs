//! The per-torrent download core.
//!
//! [`Download`] owns every piece of mutable engine state — active pieces,
//! the scheduler, the swarm registry, the peer arena — and mutates it from
//! a single cooperative task. Peer connection tasks and digest workers
//! only talk to it over channels, so every state transition here is
//! observed atomically by the rest of the system.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::net::SocketAddr;
use std::ops::Range;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bitfield::BitField;
use crate::clock::Clock;
use crate::info::TorrentInfo;
use crate::peers::{PeerConnection, PeerError, PeerErrorKind, PeerIPC};
use crate::piece_picker::Priority;
use crate::protocol::wire::WireMessage;
use crate::scheduler::Scheduler;
use crate::seeder::Seeder;
use crate::storage::{StorageFeedback, StorageHandle, StorageMessage};
use crate::swarm::{PeerSource, Swarm};
use crate::verifier::{Verifier, VerifyJob};
use crate::Config;

pub mod active_piece;
pub mod peer;
pub mod piece_store;
pub mod progress;

use active_piece::ActivePiece;
use peer::{ActivePeer, PeerCommand};
use piece_store::PieceStore;
pub use progress::{DownloadProgress, EngineEvent, PeerStats};

pub const PEER_IN_CHANNEL_CAPACITY: usize = 1000;
pub const PEER_OUT_CHANNEL_CAPACITY: usize = 2000;

/// Stable identity of a peer session within one torrent. Keys are never
/// reused, so request records and blame sets cannot point at the wrong
/// peer after churn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey(pub u64);

impl Display for PeerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl Block {
    pub fn from_position(piece: u32, position: BlockPosition) -> Self {
        Self {
            piece,
            offset: position.offset,
            length: position.length,
        }
    }

    /// Byte range within the piece.
    pub fn range(&self) -> Range<usize> {
        let offset = self.offset as usize;
        offset..offset + self.length as usize
    }
}

impl Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "block {}:{}+{}", self.piece, self.offset, self.length)
    }
}

/// A block's place within its piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPosition {
    pub offset: u32,
    pub length: u32,
}

/// Outbound block payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    pub piece: u32,
    pub offset: u32,
    pub data: Bytes,
}

impl DataBlock {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DownloadState {
    #[default]
    Pending,
    Paused,
    Seeding,
}

impl DownloadState {
    pub fn is_paused(&self) -> bool {
        *self == DownloadState::Paused
    }
}

impl Display for DownloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadState::Pending => write!(f, "Pending"),
            DownloadState::Paused => write!(f, "Paused"),
            DownloadState::Seeding => write!(f, "Seeding"),
        }
    }
}

#[derive(Debug)]
pub enum DownloadMessage {
    Pause,
    Resume,
    Abort,
    SetFilePriority {
        file: usize,
        priority: Priority,
    },
    PostState {
        tx: oneshot::Sender<StateSnapshot>,
    },
}

/// Control surface handed to the embedding application.
#[derive(Debug, Clone)]
pub struct DownloadHandle {
    pub download_tx: mpsc::Sender<DownloadMessage>,
    pub cancellation_token: CancellationToken,
}

impl DownloadHandle {
    pub fn abort(&self) {
        self.cancellation_token.cancel();
    }

    pub async fn pause(&self) -> anyhow::Result<()> {
        self.download_tx.send(DownloadMessage::Pause).await?;
        Ok(())
    }

    pub async fn resume(&self) -> anyhow::Result<()> {
        self.download_tx.send(DownloadMessage::Resume).await?;
        Ok(())
    }

    pub async fn set_file_priority(&self, file: usize, priority: Priority) -> anyhow::Result<()> {
        self.download_tx
            .send(DownloadMessage::SetFilePriority { file, priority })
            .await?;
        Ok(())
    }

    pub async fn state(&self) -> anyhow::Result<StateSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.download_tx
            .send(DownloadMessage::PostState { tx })
            .await?;
        Ok(rx.await?)
    }
}

#[derive(Debug)]
pub struct StateSnapshot {
    pub name: String,
    pub info_hash: [u8; 20],
    pub state: DownloadState,
    pub percent: f32,
    pub endgame: bool,
    pub bitfield: BitField,
    pub active_pieces: Vec<u32>,
    pub peers: Vec<PeerStats>,
    pub tick: usize,
}

/// Everything needed to open a torrent, including resume state.
#[derive(Debug, Clone)]
pub struct DownloadParams {
    pub info: TorrentInfo,
    pub bitfield: Option<BitField>,
    pub file_priorities: Vec<Priority>,
    pub local_addr: Option<SocketAddr>,
}

#[derive(Debug)]
struct PersistRequest {
    piece: u32,
    buffer: BytesMut,
    offset: u32,
    length: u32,
}

/// Glue between peer sessions, the scheduler, the verifier and the
/// persistence collaborator.
#[derive(Debug)]
pub struct Download {
    cfg: Config,
    clock: Clock,
    info: TorrentInfo,
    scheduler: Scheduler,
    store: PieceStore,
    peers: Vec<ActivePeer>,
    /// Address snapshot per key, for blame attribution after churn.
    peer_addrs: HashMap<PeerKey, SocketAddr>,
    next_peer_key: u64,
    peer_tasks: JoinSet<(PeerKey, Result<(), PeerError>)>,
    swarm: Swarm,
    verifier: Verifier,
    verifying_blame: HashMap<u32, Vec<SocketAddr>>,
    persist_retries: Vec<PersistRequest>,
    storage: StorageHandle,
    storage_rx: mpsc::Receiver<StorageFeedback>,
    new_peers: mpsc::Receiver<PeerConnection>,
    progress_tx: mpsc::Sender<DownloadProgress>,
    seeder: Seeder,
    state: DownloadState,
    events: Vec<EngineEvent>,
    downloaded: u64,
    uploaded: u64,
    /// Duplicate or unusable payload bytes, kept visible for diagnostics.
    wasted: u64,
    tick: usize,
    last_health_ms: u64,
    cancellation_token: CancellationToken,
}

impl Download {
    pub fn new(
        params: DownloadParams,
        cfg: Config,
        clock: Clock,
        storage: StorageHandle,
        storage_rx: mpsc::Receiver<StorageFeedback>,
        new_peers: mpsc::Receiver<PeerConnection>,
        progress_tx: mpsc::Sender<DownloadProgress>,
        cancellation_token: CancellationToken,
    ) -> Self {
        let info = params.info;
        let piece_count = info.piece_count();
        let bitfield = params
            .bitfield
            .unwrap_or_else(|| BitField::new(piece_count));
        let file_priorities = if params.file_priorities.is_empty() {
            vec![Priority::default(); info.files.len()]
        } else {
            params.file_priorities
        };
        let scheduler = Scheduler::new(&info, file_priorities, bitfield);
        let store = PieceStore::new(
            info.piece_length,
            info.last_piece_size(),
            cfg.max_active_pieces,
        );
        let state = if scheduler.is_complete() {
            DownloadState::Seeding
        } else {
            DownloadState::Pending
        };
        Self {
            cfg,
            clock,
            scheduler,
            store,
            peers: Vec::new(),
            peer_addrs: HashMap::new(),
            next_peer_key: 0,
            peer_tasks: JoinSet::new(),
            swarm: Swarm::new(params.local_addr),
            verifier: Verifier::with_host_parallelism(),
            verifying_blame: HashMap::new(),
            persist_retries: Vec::new(),
            storage,
            storage_rx,
            new_peers,
            progress_tx,
            seeder: Seeder::default(),
            state,
            events: Vec::new(),
            downloaded: 0,
            uploaded: 0,
            wasted: 0,
            tick: 0,
            last_health_ms: 0,
            cancellation_token,
            info,
        }
    }

    pub fn start(self, task_tracker: &TaskTracker) -> DownloadHandle {
        let (download_tx, download_rx) = mpsc::channel(100);
        let handle = DownloadHandle {
            download_tx,
            cancellation_token: self.cancellation_token.clone(),
        };
        task_tracker.spawn(async move {
            self.work(download_rx).await;
        });
        handle
    }

    async fn work(mut self, mut commands_rx: mpsc::Receiver<DownloadMessage>) {
        tracing::info!(
            torrent = %self.info.name,
            info_hash = %hex::encode(self.info.info_hash),
            pieces = self.info.piece_count(),
            "Starting download",
        );
        let mut tick_interval = tokio::time::interval(self.cfg.tick_interval);
        loop {
            let now = self.clock.now_ms();
            tracing::trace!(state = %self.state, tick = self.tick, "Download tick");

            while let Some(joined) = self.peer_tasks.try_join_next() {
                self.handle_peer_join(joined);
            }

            if self.state.is_paused() {
                self.process_paused_tick();
            } else {
                self.process_active_tick(now).await;
            }

            while let Ok(feedback) = self.storage_rx.try_recv() {
                self.handle_storage_feedback(feedback);
            }
            while let Some(verdict) = self.verifier.try_recv() {
                self.handle_verdict(verdict);
            }
            self.flush_persist_retries();

            for peer in &mut self.peers {
                peer.update_rates(self.cfg.tick_interval, self.cfg.fast_peer_threshold_bps);
            }
            self.dispatch_progress();
            self.tick += 1;

            loop {
                tokio::select! {
                    _ = tick_interval.tick() => break,
                    Some(command) = commands_rx.recv() => self.handle_command(command),
                    _ = self.cancellation_token.cancelled() => {
                        self.shutdown().await;
                        return;
                    }
                }
            }
        }
    }

    fn process_paused_tick(&mut self) {
        // remember discoveries, drop the sessions
        while let Ok(conn) = self.new_peers.try_recv() {
            self.swarm.add(conn.addr(), PeerSource::Incoming);
        }
    }

    async fn process_active_tick(&mut self, now: u64) {
        while let Ok(conn) = self.new_peers.try_recv() {
            self.add_connection(conn);
        }

        for i in 0..self.peers.len() {
            self.drain_peer_events(i, now);
        }

        self.drive_verifications(now).await;

        if now.saturating_sub(self.last_health_ms) >= self.cfg.health_interval.as_millis() as u64 {
            self.last_health_ms = now;
            self.run_health(now);
        }

        self.update_choke_and_interest();
        for i in 0..self.peers.len() {
            self.schedule_peer(i, now);
        }

        if let Some(entered) = self.scheduler.update_endgame(&self.store) {
            self.events.push(if entered {
                EngineEvent::EndgameEntered
            } else {
                EngineEvent::EndgameExited
            });
        }
    }

    fn drain_peer_events(&mut self, i: usize, now: u64) {
        let event_rx = self.peers[i].event_rx.clone();
        while let Ok(msg) = event_rx.try_recv() {
            self.handle_peer_message(i, msg, now);
        }
    }

    fn handle_peer_message(&mut self, i: usize, msg: WireMessage, now: u64) {
        match msg {
            WireMessage::KeepAlive => {}
            WireMessage::Choke => {
                // the peer dropped our outstanding requests with the choke
                self.peers[i].in_status.set_choke(true);
                let key = self.peers[i].key;
                let freed = self.store.clear_requests_for_peer(key);
                if freed > 0 {
                    tracing::debug!(peer = %self.peers[i].addr, freed, "Choked with requests in flight");
                }
                self.peers[i].inflight = 0;
            }
            WireMessage::Unchoke => self.peers[i].in_status.set_choke(false),
            WireMessage::Interested => self.peers[i].in_status.set_interest(true),
            WireMessage::NotInterested => self.peers[i].in_status.set_interest(false),
            WireMessage::Have { piece } => {
                if piece as usize >= self.info.piece_count() {
                    self.protocol_violation(i, format!("HAVE for piece {piece}"));
                    return;
                }
                self.peers[i].bitfield.set(piece as usize);
                self.scheduler.peer_has_piece(piece as usize);
            }
            WireMessage::Bitfield { .. } => {
                self.protocol_violation(i, "bitfield after the handshake".to_string());
            }
            WireMessage::Request {
                piece,
                begin,
                length,
            } => self.handle_request(i, piece, begin, length),
            WireMessage::Piece { piece, begin, data } => {
                self.handle_block(i, piece, begin, data, now);
            }
            WireMessage::Cancel {
                piece,
                begin,
                length,
            } => {
                let key = self.peers[i].key;
                self.seeder.cancel(
                    key,
                    Block {
                        piece,
                        offset: begin,
                        length,
                    },
                );
            }
            WireMessage::ExtensionHandshake { payload } => {
                self.peers[i].extension_handshake = Some(Box::new(payload));
            }
            WireMessage::Extension { id, .. } => {
                tracing::trace!(extension = id, "Ignoring unregistered extension message");
            }
        }
    }

    /// A peer wants a block from us. Valid requests for any `(begin,
    /// length)` range inside a piece we own are honored; requests for
    /// pieces we lack are dropped; out-of-range requests kill the session.
    fn handle_request(&mut self, i: usize, piece: u32, begin: u32, length: u32) {
        if piece as usize >= self.info.piece_count() {
            self.protocol_violation(i, format!("REQUEST for piece {piece}"));
            return;
        }
        let piece_size = self.info.piece_size(piece as usize);
        if length == 0
            || begin
                .checked_add(length)
                .is_none_or(|end| end > piece_size)
        {
            self.protocol_violation(
                i,
                format!("REQUEST range {begin}+{length} outside piece {piece}"),
            );
            return;
        }
        if !self.scheduler.bitfield.has(piece as usize) {
            tracing::debug!(peer = %self.peers[i].addr, piece, "Dropping request for a piece we lack");
            return;
        }
        let peer = &self.peers[i];
        if peer.out_status.is_choked() || !peer.in_status.is_interested() {
            tracing::debug!(peer = %peer.addr, piece, "Dropping request from a choked peer");
            return;
        }
        let block = Block {
            piece,
            offset: begin,
            length,
        };
        if let Some(ready) = self.seeder.request_block(peer.key, block, &self.storage) {
            self.send_upload(i, ready);
        }
    }

    /// A block arrived. Records it before any duplicate CANCELs go out, so
    /// a racing PIECE from another peer lands in the benign-duplicate path.
    fn handle_block(&mut self, i: usize, piece: u32, begin: u32, data: Bytes, now: u64) {
        if piece as usize >= self.info.piece_count() {
            self.protocol_violation(i, format!("PIECE for piece {piece}"));
            return;
        }
        let key = self.peers[i].key;
        let addr = self.peers[i].addr;

        let Some(active) = self.store.get_mut(piece) else {
            // late arrival for a piece we finished or abandoned
            tracing::trace!(peer = %addr, piece, "Dropping block for an inactive piece");
            self.wasted += data.len() as u64;
            return;
        };
        let Some(block) = active.block_at(begin) else {
            self.protocol_violation(i, format!("PIECE offset {begin} in piece {piece}"));
            return;
        };
        let position = active.block_position(block);
        if data.len() != position.length as usize {
            self.protocol_violation(
                i,
                format!(
                    "PIECE payload of {} bytes, block is {}",
                    data.len(),
                    position.length
                ),
            );
            return;
        }

        let had_request = active.has_pending_request(block, key);
        let other_requesters = active.other_requesters(block, key);
        if !active.add_block(block, &data, key, now) {
            tracing::trace!(peer = %addr, %piece, block, "Duplicate block");
            self.wasted += data.len() as u64;
            return;
        }

        if had_request {
            self.peers[i].inflight = self.peers[i].inflight.saturating_sub(1);
        }
        self.peers[i].downloaded += data.len() as u64;
        self.downloaded += data.len() as u64;
        self.swarm.credit_transfer(addr, data.len() as u64, 0);

        // the block is recorded; now call off the other transfers
        let cancel = Block::from_position(piece, position);
        for other in other_requesters {
            if let Some(j) = self.peer_index(other) {
                self.peers[j].send(PeerCommand::Cancel(cancel));
                self.peers[j].inflight = self.peers[j].inflight.saturating_sub(1);
            }
        }
    }

    /// Detaches completed pieces and hands them to the digest workers.
    async fn drive_verifications(&mut self, _now: u64) {
        let completed: Vec<u32> = self
            .store
            .iter()
            .filter(|p| p.has_all_blocks())
            .map(ActivePiece::index)
            .collect();
        for index in completed {
            let piece = self.store.remove(index).expect("piece listed as complete");
            let blame = piece
                .contributing_peers()
                .iter()
                .filter_map(|key| self.peer_addrs.get(key).copied())
                .collect();
            self.verifying_blame.insert(index, blame);
            self.scheduler.begin_verification(index);
            tracing::debug!(piece = index, "Piece complete, verifying");
            self.verifier
                .submit(VerifyJob {
                    piece: index,
                    expected: self.info.expected_hash(index as usize),
                    buffer: piece.assemble(),
                })
                .await;
        }
    }

    fn handle_verdict(&mut self, verdict: crate::verifier::Verdict) {
        let blame = self
            .verifying_blame
            .remove(&verdict.piece)
            .unwrap_or_default();
        if verdict.ok {
            // bitfield first, HAVE only after persistence acknowledges
            self.scheduler.mark_verified(verdict.piece);
            self.events.push(EngineEvent::PieceVerified(verdict.piece));
            match self.scheduler.persist_extent(verdict.piece) {
                Some((offset, length)) => self.queue_persist(PersistRequest {
                    piece: verdict.piece,
                    buffer: verdict.buffer,
                    offset,
                    length,
                }),
                None => self.store.release_buffer(verdict.buffer),
            }
            if self.scheduler.is_complete() && self.state == DownloadState::Pending {
                self.set_state(DownloadState::Seeding);
            }
        } else {
            self.scheduler.verification_failed(verdict.piece);
            self.store.release_buffer(verdict.buffer);
            for addr in &blame {
                self.swarm
                    .record_hash_failure(*addr, self.cfg.hash_failure_ban_threshold);
                if self.swarm.is_banned(*addr) {
                    if let Some(j) = self.peers.iter().position(|p| p.addr == *addr) {
                        self.peers[j].disconnect();
                    }
                }
            }
            tracing::warn!(piece = verdict.piece, contributors = blame.len(), "Discarding corrupt piece");
            self.events.push(EngineEvent::PieceFailed {
                piece: verdict.piece,
                blame,
            });
        }
    }

    fn queue_persist(&mut self, request: PersistRequest) {
        match self.storage.try_persist(
            request.piece,
            request.buffer,
            request.offset,
            request.length,
        ) {
            Ok(()) => {}
            Err(StorageMessage::Persist {
                piece,
                buffer,
                offset,
                length,
            }) => {
                tracing::debug!(piece, "Persistence channel is full, retrying next tick");
                self.persist_retries.push(PersistRequest {
                    piece,
                    buffer,
                    offset,
                    length,
                });
            }
            Err(_) => unreachable!("persist send returns the persist message"),
        }
    }

    fn flush_persist_retries(&mut self) {
        for request in std::mem::take(&mut self.persist_retries) {
            self.queue_persist(request);
        }
    }

    fn handle_storage_feedback(&mut self, feedback: StorageFeedback) {
        match feedback {
            StorageFeedback::Persisted { piece, buffer } => {
                self.store.release_buffer(buffer);
                for peer in &self.peers {
                    peer.send(PeerCommand::Have { piece });
                }
            }
            StorageFeedback::PersistFailed {
                piece,
                buffer,
                reason,
            } => {
                // the piece stays verified in memory; HAVE waits for the ack
                tracing::error!(piece, "Failed to persist piece: {reason}");
                self.events.push(EngineEvent::PersistenceFailure {
                    piece,
                    reason,
                });
                match self.scheduler.persist_extent(piece) {
                    Some((offset, length)) => self.persist_retries.push(PersistRequest {
                        piece,
                        buffer,
                        offset,
                        length,
                    }),
                    None => self.store.release_buffer(buffer),
                }
            }
            StorageFeedback::Data { piece, bytes } => {
                for (key, ready) in self.seeder.handle_retrieved(piece, bytes) {
                    if let Some(j) = self.peer_index(key) {
                        if !self.peers[j].out_status.is_choked()
                            && self.peers[j].in_status.is_interested()
                        {
                            self.send_upload(j, ready);
                        }
                    }
                }
            }
        }
    }

    fn send_upload(&mut self, i: usize, data: DataBlock) {
        let len = data.len() as u64;
        let addr = self.peers[i].addr;
        self.peers[i].uploaded += len;
        self.uploaded += len;
        self.swarm.credit_transfer(addr, 0, len);
        self.peers[i].send(PeerCommand::Upload(data));
    }

    /// The periodic health pass: reap stale requests, abandon stuck
    /// pieces, release ownership held by departed peers.
    fn run_health(&mut self, now: u64) {
        let timeout_ms = self.cfg.request_timeout.as_millis() as u64;
        let mut stale: Vec<(u32, BlockPosition, PeerKey)> = Vec::new();
        for piece in self.store.iter_mut() {
            for (block, key) in piece.take_stale_requests(timeout_ms, now) {
                stale.push((piece.index(), piece.block_position(block), key));
            }
        }
        for (piece, position, key) in stale {
            let Some(i) = self.peer_index(key) else {
                continue;
            };
            tracing::debug!(peer = %self.peers[i].addr, piece, offset = position.offset, "Request timed out");
            self.peers[i].send(PeerCommand::Cancel(Block::from_position(piece, position)));
            self.peers[i].inflight = self.peers[i].inflight.saturating_sub(1);
            self.peers[i].timeout_strikes += 1;
        }

        // demote peers that keep timing out
        for i in 0..self.peers.len() {
            let peer = &self.peers[i];
            if peer.timeout_strikes >= self.cfg.timeout_strike_threshold
                && !peer.cancellation_token.is_cancelled()
            {
                tracing::warn!(peer = %peer.addr, strikes = peer.timeout_strikes, "Dropping unresponsive peer");
                self.swarm.mark_failed(peer.addr);
                peer.disconnect();
            }
        }

        let stall_ms = self.cfg.piece_stall_timeout.as_millis() as u64;
        let stuck: Vec<u32> = self
            .store
            .iter()
            .filter(|p| p.should_abandon(stall_ms, self.cfg.stall_min_progress, now))
            .map(ActivePiece::index)
            .collect();
        for index in stuck {
            let piece = self.store.get_mut(index).expect("piece listed as stuck");
            let outstanding = piece.take_stale_requests(0, now);
            let cancels: Vec<(BlockPosition, PeerKey)> = outstanding
                .into_iter()
                .map(|(block, key)| (piece.block_position(block), key))
                .collect();
            for (position, key) in cancels {
                if let Some(i) = self.peer_index(key) {
                    self.peers[i].send(PeerCommand::Cancel(Block::from_position(index, position)));
                    self.peers[i].inflight = self.peers[i].inflight.saturating_sub(1);
                }
            }
            tracing::warn!(piece = index, "Abandoning stuck piece");
            self.store.retire(index);
        }

        let connected: HashSet<PeerKey> = self.peers.iter().map(|p| p.key).collect();
        for piece in self.store.iter_mut() {
            if let Some(owner) = piece.exclusive() {
                if !connected.contains(&owner) {
                    piece.clear_exclusive();
                }
            }
        }
    }

    fn update_choke_and_interest(&mut self) {
        for peer in &mut self.peers {
            let useful = self.scheduler.peer_is_useful(&peer.bitfield);
            peer.set_out_interest(useful);
        }
        let mut slots = self.cfg.upload_slots;
        for peer in &mut self.peers {
            if peer.in_status.is_interested() && slots > 0 {
                peer.set_out_choke(false);
                slots -= 1;
            } else {
                peer.set_out_choke(true);
            }
        }
    }

    fn schedule_peer(&mut self, i: usize, now: u64) {
        if self.peers[i].in_status.is_choked() || !self.peers[i].out_status.is_interested() {
            return;
        }
        let blocks =
            self.scheduler
                .schedule_for_peer(&mut self.peers[i], &mut self.store, &self.cfg, now);
        for block in blocks {
            self.peers[i].inflight += 1;
            self.peers[i].send(PeerCommand::Request(block));
        }
    }

    fn add_connection(&mut self, conn: PeerConnection) {
        let addr = conn.addr();
        if self.swarm.is_banned(addr) {
            tracing::debug!(peer = %addr, "Dropping session from banned peer");
            return;
        }
        let key = self.allocate_key();
        let (command_tx, command_rx) = flume::bounded(PEER_OUT_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = flume::bounded(PEER_IN_CHANNEL_CAPACITY);
        let token = self.cancellation_token.child_token();
        let peer = ActivePeer::new(
            key,
            addr,
            conn.peer_id(),
            conn.bitfield().clone(),
            conn.extension_handshake().cloned().map(Box::new),
            command_tx,
            event_rx,
            conn.counters(),
            token.clone(),
        );
        let ipc = PeerIPC {
            event_tx,
            command_rx,
        };
        self.peer_tasks
            .spawn(async move { (key, conn.run(ipc, token).await) });
        self.register_peer(peer);
    }

    /// Insert a fully constructed core-side peer.
    fn register_peer(&mut self, peer: ActivePeer) {
        if !self
            .swarm
            .session_started(peer.addr, PeerSource::Incoming, peer.peer_id.0)
        {
            tracing::debug!(peer = %peer.addr, "Dropping refused session");
            peer.disconnect();
            return;
        }
        tracing::info!(peer = %peer.addr, key = %peer.key, "Peer connected");
        self.peer_addrs.insert(peer.key, peer.addr);
        self.scheduler.peer_joined(&peer.bitfield);
        self.events.push(EngineEvent::PeerConnected(peer.addr));
        let useful = self.scheduler.peer_is_useful(&peer.bitfield);
        self.peers.push(peer);
        self.peers
            .last_mut()
            .expect("just pushed")
            .set_out_interest(useful);
    }

    fn allocate_key(&mut self) -> PeerKey {
        let key = PeerKey(self.next_peer_key);
        self.next_peer_key += 1;
        key
    }

    fn peer_index(&self, key: PeerKey) -> Option<usize> {
        self.peers.iter().position(|p| p.key == key)
    }

    fn handle_peer_join(
        &mut self,
        joined: Result<(PeerKey, Result<(), PeerError>), tokio::task::JoinError>,
    ) {
        match joined {
            Ok((key, result)) => {
                let error = result.err();
                if let Some(e) = &error {
                    tracing::debug!(%key, "Peer session ended: {e}");
                }
                self.handle_disconnect(key, error);
            }
            Err(e) => {
                tracing::error!("Peer task panicked: {e}");
            }
        }
    }

    fn handle_disconnect(&mut self, key: PeerKey, error: Option<PeerError>) {
        let Some(i) = self.peer_index(key) else {
            return;
        };
        let peer = self.peers.swap_remove(i);
        let freed = self.store.clear_requests_for_peer(key);
        if freed > 0 {
            tracing::debug!(peer = %peer.addr, freed, "Returned blocks to the unrequested set");
        }
        self.scheduler.peer_left(&peer.bitfield);
        self.seeder.peer_gone(key);
        if error.as_ref().is_some_and(|e| e.kind == PeerErrorKind::Protocol) {
            self.swarm.mark_failed(peer.addr);
        }
        self.swarm.session_closed(peer.addr, error.is_some());
        self.events.push(EngineEvent::PeerDisconnected(peer.addr));
        tracing::info!(peer = %peer.addr, %key, "Peer disconnected");
    }

    /// Core-detected misbehavior: the session dies and the swarm entry
    /// remembers the failure.
    fn protocol_violation(&mut self, i: usize, reason: String) {
        let peer = &self.peers[i];
        tracing::warn!(peer = %peer.addr, "Protocol violation: {reason}");
        self.swarm.mark_failed(peer.addr);
        peer.disconnect();
    }

    fn handle_command(&mut self, command: DownloadMessage) {
        match command {
            DownloadMessage::Pause => self.set_state(DownloadState::Paused),
            DownloadMessage::Resume => {
                if self.state.is_paused() {
                    if self.scheduler.is_complete() {
                        self.set_state(DownloadState::Seeding);
                    } else {
                        self.set_state(DownloadState::Pending);
                    }
                }
            }
            DownloadMessage::Abort => {
                tracing::debug!("Aborting download");
                self.cancellation_token.cancel();
            }
            DownloadMessage::SetFilePriority { file, priority } => {
                match self.scheduler.set_file_priority(file, priority, &self.store) {
                    Ok(abandoned) => {
                        self.events
                            .push(EngineEvent::FilePriorityChange { file, priority });
                        let now = self.clock.now_ms();
                        for index in abandoned {
                            self.abandon_piece(index, now);
                        }
                    }
                    Err(e) => tracing::warn!(file, "Rejected priority change: {e}"),
                }
            }
            DownloadMessage::PostState { tx } => {
                let _ = tx.send(self.snapshot());
            }
        }
    }

    fn abandon_piece(&mut self, index: u32, now: u64) {
        let Some(piece) = self.store.get_mut(index) else {
            return;
        };
        let cancels: Vec<(BlockPosition, PeerKey)> = piece
            .take_stale_requests(0, now)
            .into_iter()
            .map(|(block, key)| (piece.block_position(block), key))
            .collect();
        for (position, key) in cancels {
            if let Some(i) = self.peer_index(key) {
                self.peers[i].send(PeerCommand::Cancel(Block::from_position(index, position)));
                self.peers[i].inflight = self.peers[i].inflight.saturating_sub(1);
            }
        }
        self.store.retire(index);
    }

    fn set_state(&mut self, new_state: DownloadState) {
        if new_state == self.state {
            tracing::warn!(%new_state, "Redundant state change");
            return;
        }
        tracing::info!(from = %self.state, to = %new_state, "Download state change");
        if new_state.is_paused() {
            for peer in &self.peers {
                peer.disconnect();
            }
        }
        self.state = new_state;
        self.events.push(EngineEvent::StateChange(new_state));
    }

    fn peer_stats(&self) -> Vec<PeerStats> {
        self.peers
            .iter()
            .map(|p| PeerStats {
                addr: p.addr,
                downloaded: p.downloaded,
                uploaded: p.uploaded,
                download_speed: p.performance.download_speed_bps(self.cfg.tick_interval),
                upload_speed: p.performance.upload_speed_bps(self.cfg.tick_interval),
                inflight: p.inflight,
                fast: p.fast,
            })
            .collect()
    }

    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            name: self.info.name.clone(),
            info_hash: self.info.info_hash,
            state: self.state,
            percent: self.scheduler.downloaded_percent(),
            endgame: self.scheduler.is_endgame(),
            bitfield: self.scheduler.bitfield.clone(),
            active_pieces: self.store.indexes(),
            peers: self.peer_stats(),
            tick: self.tick,
        }
    }

    fn dispatch_progress(&mut self) {
        let progress = DownloadProgress {
            tick: self.tick,
            percent: self.scheduler.downloaded_percent(),
            downloaded: self.downloaded,
            uploaded: self.uploaded,
            peers: self.peer_stats(),
            events: std::mem::take(&mut self.events),
        };
        match self.progress_tx.try_send(progress) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(mut bounced)) => {
                // snapshots are disposable, events are not
                tracing::trace!(tick = self.tick, "Progress receiver is lagging");
                self.events.append(&mut bounced.events);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!("Shutting down download");
        while self.peer_tasks.join_next().await.is_some() {}
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use crate::bitfield::BitField;
    use crate::info::TorrentInfo;
    use crate::protocol::PeerId;

    use super::peer::{ActivePeer, TransferCounters};
    use super::PeerKey;

    pub(crate) fn test_info(pieces: usize, piece_length: u32) -> TorrentInfo {
        TorrentInfo::new(
            [7; 20],
            "test torrent",
            piece_length,
            pieces as u64 * piece_length as u64,
            vec![[0; 20]; pieces],
            vec![],
        )
        .unwrap()
    }

    pub(crate) fn test_addr(n: u64) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, (n >> 8) as u8, n as u8)), 6881)
    }

    /// A core-side peer whose channel counterparts are dropped; good enough
    /// for scheduler-level tests that never send commands.
    pub(crate) fn test_peer(key: PeerKey, piece_count: usize, have: &[usize]) -> ActivePeer {
        let (command_tx, _command_rx) = flume::bounded(64);
        let (_event_tx, event_rx) = flume::bounded(64);
        let mut bitfield = BitField::new(piece_count);
        for piece in have {
            bitfield.set(*piece);
        }
        ActivePeer::new(
            key,
            test_addr(key.0),
            PeerId::generate(),
            bitfield,
            None,
            command_tx,
            event_rx,
            Arc::new(TransferCounters::default()),
            CancellationToken::new(),
        )
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use sha1::{Digest, Sha1};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::TaskTracker;
    use tracing_test::traced_test;

    use super::peer::PeerCommand;
    use super::test_support::{test_addr, test_info, test_peer};
    use super::{
        Block, Download, DownloadParams, DownloadState, EngineEvent, PeerKey,
    };
    use crate::clock::Clock;
    use crate::info::TorrentInfo;
    use crate::protocol::wire::WireMessage;
    use crate::storage::MemoryStorage;
    use crate::Config;
    use crate::BLOCK_LENGTH;

    struct PeerEnd {
        key: PeerKey,
        commands: flume::Receiver<PeerCommand>,
    }

    struct Harness {
        download: Download,
        ends: Vec<PeerEnd>,
        _tracker: TaskTracker,
        _progress_rx: mpsc::Receiver<super::DownloadProgress>,
    }

    impl Harness {
        fn new(info: TorrentInfo, cfg: Config) -> Self {
            let tracker = TaskTracker::new();
            let token = CancellationToken::new();
            let (storage, storage_rx) = MemoryStorage::spawn(&tracker, token.clone());
            let (_new_tx, new_rx) = mpsc::channel(8);
            // leak the sender so the channel stays open for the test
            std::mem::forget(_new_tx);
            let (progress_tx, progress_rx) = mpsc::channel(64);
            let download = Download::new(
                DownloadParams {
                    info,
                    bitfield: None,
                    file_priorities: vec![],
                    local_addr: None,
                },
                cfg,
                Clock::manual(0),
                storage,
                storage_rx,
                new_rx,
                progress_tx,
                token,
            );
            Self {
                download,
                ends: Vec::new(),
                _tracker: tracker,
                _progress_rx: progress_rx,
            }
        }

        fn add_peer(&mut self, have: &[usize]) -> usize {
            let key = self.download.allocate_key();
            let mut peer = test_peer(key, self.download.info.piece_count(), have);
            let (command_tx, command_rx) = flume::bounded(256);
            peer.command_tx = command_tx;
            self.download.register_peer(peer);
            self.ends.push(PeerEnd {
                key,
                commands: command_rx,
            });
            self.ends.len() - 1
        }

        fn now(&self) -> u64 {
            self.download.clock.now_ms()
        }

        fn msg(&mut self, peer: usize, msg: WireMessage) {
            let key = self.ends[peer].key;
            let i = self.download.peer_index(key).expect("peer is connected");
            let now = self.now();
            self.download.handle_peer_message(i, msg, now);
        }

        fn unchoke_and_schedule(&mut self, peer: usize) {
            self.msg(peer, WireMessage::Unchoke);
            self.schedule(peer);
        }

        fn schedule(&mut self, peer: usize) {
            let key = self.ends[peer].key;
            let i = self.download.peer_index(key).expect("peer is connected");
            let now = self.now();
            self.download.schedule_peer(i, now);
        }

        fn commands(&mut self, peer: usize) -> Vec<PeerCommand> {
            let mut out = Vec::new();
            while let Ok(command) = self.ends[peer].commands.try_recv() {
                out.push(command);
            }
            out
        }

        fn requests(&mut self, peer: usize) -> Vec<Block> {
            self.commands(peer)
                .into_iter()
                .filter_map(|c| match c {
                    PeerCommand::Request(block) => Some(block),
                    _ => None,
                })
                .collect()
        }

        fn send_block(&mut self, peer: usize, piece: u32, begin: u32, data: &[u8]) {
            self.msg(
                peer,
                WireMessage::Piece {
                    piece,
                    begin,
                    data: Bytes::copy_from_slice(data),
                },
            );
        }

        async fn verify_round_trip(&mut self) {
            let now = self.now();
            self.download.drive_verifications(now).await;
            let verdict = self.download.verifier.recv().await;
            self.download.handle_verdict(verdict);
        }

        async fn pump_storage(&mut self) {
            let feedback = self.download.storage_rx.recv().await.unwrap();
            self.download.handle_storage_feedback(feedback);
        }

        fn disconnect(&mut self, peer: usize) {
            let key = self.ends[peer].key;
            self.download.handle_disconnect(key, None);
        }

        fn events(&mut self) -> Vec<EngineEvent> {
            std::mem::take(&mut self.download.events)
        }
    }

    fn piece_content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn hashed_info(piece_length: u32, pieces: Vec<&[u8]>) -> TorrentInfo {
        let total: u64 = pieces.iter().map(|p| p.len() as u64).sum();
        let hashes = pieces
            .iter()
            .map(|p| Sha1::digest(p).into())
            .collect();
        TorrentInfo::new([7; 20], "test torrent", piece_length, total, hashes, vec![]).unwrap()
    }

    #[tokio::test]
    #[traced_test]
    async fn single_piece_single_peer_happy_path() {
        let content = piece_content(4 * BLOCK_LENGTH as usize);
        let info = hashed_info(4 * BLOCK_LENGTH, vec![&content]);
        let mut h = Harness::new(info, Config::default());

        let a = h.add_peer(&[0]);
        // registering a useful peer makes us interested
        assert!(h.commands(a).contains(&PeerCommand::Interested));

        h.unchoke_and_schedule(a);
        let requests = h.requests(a);
        assert_eq!(requests.len(), 4);
        for (i, block) in requests.iter().enumerate() {
            assert_eq!(block.piece, 0);
            assert_eq!(block.offset, i as u32 * BLOCK_LENGTH);
            assert_eq!(block.length, BLOCK_LENGTH);
        }

        for block in &requests {
            h.send_block(a, 0, block.offset, &content[block.range()]);
        }
        h.verify_round_trip().await;
        assert!(h.download.scheduler.bitfield.has(0));
        assert_eq!(h.download.state, DownloadState::Seeding);
        assert_eq!(h.download.downloaded, content.len() as u64);

        // HAVE goes out only once persistence acknowledges
        assert!(!h
            .commands(a)
            .contains(&PeerCommand::Have { piece: 0 }));
        h.pump_storage().await;
        assert!(h.commands(a).contains(&PeerCommand::Have { piece: 0 }));

        let events = h.events();
        assert!(events.contains(&EngineEvent::PieceVerified(0)));
        assert!(events.contains(&EngineEvent::StateChange(DownloadState::Seeding)));
    }

    #[tokio::test]
    #[traced_test]
    async fn disconnect_returns_requests_to_the_pool() {
        let mut cfg = Config::default();
        cfg.pipeline_depth = 2;
        let info = test_info(2, 4 * BLOCK_LENGTH);
        let mut h = Harness::new(info, cfg);

        let a = h.add_peer(&[0, 1]);
        h.unchoke_and_schedule(a);
        let requests = h.requests(a);
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|b| b.piece == 0));
        assert_eq!(h.download.store.get(0).unwrap().needed_blocks(16).len(), 2);

        h.disconnect(a);
        // all four blocks of piece 0 are requestable again
        assert_eq!(h.download.store.get(0).unwrap().needed_blocks(16).len(), 4);

        let b = h.add_peer(&[0, 1]);
        h.unchoke_and_schedule(b);
        let requests = h.requests(b);
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|b| b.piece == 0));
        assert_eq!(requests[0].offset, 0);
        assert_eq!(requests[1].offset, BLOCK_LENGTH);
    }

    #[tokio::test]
    #[traced_test]
    async fn timeout_reaps_only_the_stale_request() {
        let mut cfg = Config::default();
        cfg.pipeline_depth = 1;
        let info = test_info(1, 4 * BLOCK_LENGTH);
        let mut h = Harness::new(info, cfg);

        let a = h.add_peer(&[0]);
        let b = h.add_peer(&[0]);
        h.unchoke_and_schedule(a);
        assert_eq!(h.requests(a), vec![Block { piece: 0, offset: 0, length: BLOCK_LENGTH }]);

        h.download.clock.advance(25_000);
        h.unchoke_and_schedule(b);
        assert_eq!(
            h.requests(b),
            vec![Block { piece: 0, offset: BLOCK_LENGTH, length: BLOCK_LENGTH }]
        );

        h.download.clock.advance(6_000);
        let now = h.now();
        h.download.run_health(now);

        // A's request went stale, B's survives
        assert_eq!(
            h.commands(a),
            vec![PeerCommand::Cancel(Block { piece: 0, offset: 0, length: BLOCK_LENGTH })]
        );
        assert!(h.commands(b).is_empty());
        let piece = h.download.store.get(0).unwrap();
        assert!(piece.needed_blocks(16).iter().any(|p| p.offset == 0));
        assert!(piece.has_pending_request(1, h.ends[b].key));
        let ai = h.download.peer_index(h.ends[a].key).unwrap();
        assert_eq!(h.download.peers[ai].timeout_strikes, 1);
        assert_eq!(h.download.peers[ai].inflight, 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn endgame_duplicates_and_cancels_the_loser() {
        let content = piece_content(2 * BLOCK_LENGTH as usize);
        let info = hashed_info(2 * BLOCK_LENGTH, vec![&content]);
        let mut h = Harness::new(info, Config::default());

        let a = h.add_peer(&[0]);
        h.unchoke_and_schedule(a);
        assert_eq!(h.requests(a).len(), 2);

        assert_eq!(
            h.download.scheduler.update_endgame(&h.download.store),
            Some(true)
        );

        let b = h.add_peer(&[0]);
        h.unchoke_and_schedule(b);
        // B legitimately double-requests the blocks A is holding
        assert_eq!(h.requests(b).len(), 2);

        // B answers first; A gets a CANCEL for that block
        h.send_block(b, 0, 0, &content[..BLOCK_LENGTH as usize]);
        assert_eq!(
            h.commands(a),
            vec![PeerCommand::Cancel(Block { piece: 0, offset: 0, length: BLOCK_LENGTH })]
        );

        // A's transfer was already on the wire; it lands as a benign duplicate
        let wasted_before = h.download.wasted;
        h.send_block(a, 0, 0, &content[..BLOCK_LENGTH as usize]);
        assert_eq!(
            h.download.wasted,
            wasted_before + BLOCK_LENGTH as u64
        );
        assert_eq!(h.download.store.get(0).unwrap().received_count(), 1);
        assert_eq!(h.download.downloaded, BLOCK_LENGTH as u64);
    }

    #[tokio::test]
    #[traced_test]
    async fn hash_failure_blames_all_contributors() {
        // digests of zero can never match the garbage we feed in
        let info = test_info(1, 4 * BLOCK_LENGTH);
        let mut h = Harness::new(info, Config::default());

        let a = h.add_peer(&[0]);
        let b = h.add_peer(&[0]);
        h.unchoke_and_schedule(a);

        let junk = vec![0x5a_u8; BLOCK_LENGTH as usize];
        h.send_block(a, 0, 0, &junk);
        h.send_block(a, 0, BLOCK_LENGTH, &junk);
        h.send_block(b, 0, 2 * BLOCK_LENGTH, &junk);
        h.send_block(b, 0, 3 * BLOCK_LENGTH, &junk);

        h.verify_round_trip().await;
        assert!(!h.download.scheduler.bitfield.has(0));
        assert!(!h.download.store.contains(0));

        let events = h.events();
        let blame = events
            .iter()
            .find_map(|e| match e {
                EngineEvent::PieceFailed { piece: 0, blame } => Some(blame.clone()),
                _ => None,
            })
            .expect("piece failure event");
        assert_eq!(blame.len(), 2);
        assert!(blame.contains(&test_addr(h.ends[a].key.0)));
        assert!(blame.contains(&test_addr(h.ends[b].key.0)));
        for end in [a, b] {
            let addr = test_addr(h.ends[end].key.0);
            assert_eq!(h.download.swarm.get(addr).unwrap().hash_failures, 1);
        }

        // the piece is re-eligible
        h.schedule(a);
        assert_eq!(h.requests(a).len(), 4);
    }

    #[tokio::test]
    #[traced_test]
    async fn speed_affinity_excludes_slow_peers_until_owner_leaves() {
        let info = test_info(1, 4 * BLOCK_LENGTH);
        let mut h = Harness::new(info, Config::default());

        let fast = h.add_peer(&[0]);
        let fast_idx = h.download.peer_index(h.ends[fast].key).unwrap();
        h.download.peers[fast_idx].fast = true;
        h.unchoke_and_schedule(fast);
        assert_eq!(h.requests(fast).len(), 4);
        assert_eq!(
            h.download.store.get(0).unwrap().exclusive(),
            Some(h.ends[fast].key)
        );

        // a slow peer is locked out entirely
        let slow = h.add_peer(&[0]);
        h.unchoke_and_schedule(slow);
        assert!(h.requests(slow).is_empty());
        // another fast peer would be allowed in
        assert!(h
            .download
            .store
            .get(0)
            .unwrap()
            .can_request_from(PeerKey(999), true));

        // the owner leaving releases the piece to everyone
        h.disconnect(fast);
        assert_eq!(h.download.store.get(0).unwrap().exclusive(), None);
        h.schedule(slow);
        assert_eq!(h.requests(slow).len(), 4);
    }

    #[tokio::test]
    #[traced_test]
    async fn choke_clears_inflight_requests() {
        let info = test_info(1, 2 * BLOCK_LENGTH);
        let mut h = Harness::new(info, Config::default());
        let a = h.add_peer(&[0]);
        h.unchoke_and_schedule(a);
        assert_eq!(h.requests(a).len(), 2);

        h.msg(a, WireMessage::Choke);
        let i = h.download.peer_index(h.ends[a].key).unwrap();
        assert_eq!(h.download.peers[i].inflight, 0);
        assert_eq!(h.download.store.get(0).unwrap().needed_blocks(16).len(), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn serves_blocks_to_interested_unchoked_peers() {
        let content = piece_content(2 * BLOCK_LENGTH as usize);
        let info = hashed_info(2 * BLOCK_LENGTH, vec![&content]);
        let mut h = Harness::new(info, Config::default());

        // download the piece from A
        let a = h.add_peer(&[0]);
        h.unchoke_and_schedule(a);
        for block in h.requests(a) {
            h.send_block(a, 0, block.offset, &content[block.range()]);
        }
        h.verify_round_trip().await;
        h.pump_storage().await;

        // B wants it back
        let b = h.add_peer(&[]);
        h.msg(b, WireMessage::Interested);
        h.download.update_choke_and_interest();
        assert!(h.commands(b).contains(&PeerCommand::Unchoke));

        h.msg(
            b,
            WireMessage::Request {
                piece: 0,
                begin: 100,
                length: 1000,
            },
        );
        h.pump_storage().await;
        let uploads: Vec<_> = h
            .commands(b)
            .into_iter()
            .filter_map(|c| match c {
                PeerCommand::Upload(data) => Some(data),
                _ => None,
            })
            .collect();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].offset, 100);
        assert_eq!(&uploads[0].data[..], &content[100..1100]);
        assert_eq!(h.download.uploaded, 1000);
    }

    #[tokio::test]
    #[traced_test]
    async fn out_of_range_request_is_fatal() {
        let info = test_info(1, 2 * BLOCK_LENGTH);
        let mut h = Harness::new(info, Config::default());
        let a = h.add_peer(&[0]);
        h.msg(
            a,
            WireMessage::Request {
                piece: 0,
                begin: 2 * BLOCK_LENGTH - 4,
                length: 8,
            },
        );
        let i = h.download.peer_index(h.ends[a].key).unwrap();
        assert!(h.download.peers[i].cancellation_token.is_cancelled());
        let addr = test_addr(h.ends[a].key.0);
        assert_eq!(h.download.swarm.get(addr).unwrap().failures, 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn stuck_piece_is_abandoned_and_restartable() {
        let info = test_info(1, 4 * BLOCK_LENGTH);
        let mut h = Harness::new(info, Config::default());
        let a = h.add_peer(&[0]);
        h.unchoke_and_schedule(a);
        assert_eq!(h.requests(a).len(), 4);
        // one block arrives, then silence
        let data = vec![1u8; BLOCK_LENGTH as usize];
        h.send_block(a, 0, 0, &data);

        h.download.clock.advance(121_000);
        let now = h.now();
        h.download.run_health(now);
        assert!(!h.download.store.contains(0));
        // outstanding transfers were called off
        let cancels = h
            .commands(a)
            .iter()
            .filter(|c| matches!(c, PeerCommand::Cancel(_)))
            .count();
        assert_eq!(cancels, 3);

        // the piece restarts from scratch on the next schedule
        h.schedule(a);
        assert_eq!(h.requests(a).len(), 4);
    }
}
