//! Registry of every remote address this torrent has heard of.
//!
//! The engine never dials; the surrounding layer asks [`Swarm::best_candidate`]
//! whom to try next and reports session outcomes back. Bans decided here
//! (protocol violations, digest blame, timeout strikes) gate inbound
//! sessions too.

use std::collections::HashMap;
use std::hash::Hasher;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    Tracker,
    Dht,
    Pex,
    Incoming,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanReason {
    ProtocolViolation,
    HashFailures,
    TimeoutStrikes,
}

impl std::fmt::Display for BanReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BanReason::ProtocolViolation => write!(f, "protocol violation"),
            BanReason::HashFailures => write!(f, "piece digest failures"),
            BanReason::TimeoutStrikes => write!(f, "request timeouts"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwarmState {
    Stored,
    Connecting,
    Active,
    Banned,
}

#[derive(Debug)]
pub struct SwarmPeer {
    pub addr: SocketAddr,
    pub source: PeerSource,
    pub state: SwarmState,
    pub peer_id: Option<[u8; 20]>,
    pub country_hint: Option<[u8; 2]>,
    pub connect_attempts: u32,
    pub failures: u32,
    pub hash_failures: u32,
    pub downloaded: u64,
    pub uploaded: u64,
    pub ban: Option<BanReason>,
    priority: u32,
}

#[derive(Debug, Default)]
pub struct Swarm {
    entries: HashMap<SocketAddr, SwarmPeer>,
    local_addr: Option<SocketAddr>,
}

impl Swarm {
    const MAX_SIZE: usize = 1_000;

    pub fn new(local_addr: Option<SocketAddr>) -> Self {
        Self {
            entries: HashMap::new(),
            local_addr,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, addr: SocketAddr) -> Option<&SwarmPeer> {
        self.entries.get(&addr)
    }

    /// Returns whether the address was new.
    pub fn add(&mut self, addr: SocketAddr, source: PeerSource) -> bool {
        if self.entries.len() >= Self::MAX_SIZE && !self.entries.contains_key(&addr) {
            tracing::warn!(%addr, "Swarm registry is full, dropping discovery");
            return false;
        }
        let priority = self
            .local_addr
            .map_or(0, |local| canonical_priority(local, addr));
        match self.entries.entry(addr) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(SwarmPeer {
                    addr,
                    source,
                    state: SwarmState::Stored,
                    peer_id: None,
                    country_hint: None,
                    connect_attempts: 0,
                    failures: 0,
                    hash_failures: 0,
                    downloaded: 0,
                    uploaded: 0,
                    ban: None,
                    priority,
                });
                true
            }
        }
    }

    pub fn is_banned(&self, addr: SocketAddr) -> bool {
        self.entries
            .get(&addr)
            .is_some_and(|p| p.state == SwarmState::Banned)
    }

    /// Highest-priority stored peer (BEP 40 ordering). The caller dials it.
    pub fn best_candidate(&mut self) -> Option<SocketAddr> {
        let best = self
            .entries
            .values()
            .filter(|p| p.state == SwarmState::Stored)
            .max_by_key(|p| p.priority)
            .map(|p| p.addr)?;
        let entry = self.entries.get_mut(&best).expect("just found it");
        entry.state = SwarmState::Connecting;
        entry.connect_attempts += 1;
        Some(best)
    }

    /// An inbound or completed outbound session became active. Banned
    /// addresses are refused.
    pub fn session_started(
        &mut self,
        addr: SocketAddr,
        source: PeerSource,
        peer_id: [u8; 20],
    ) -> bool {
        self.add(addr, source);
        let Some(entry) = self.entries.get_mut(&addr) else {
            return false;
        };
        if entry.state == SwarmState::Banned {
            tracing::debug!(%addr, "Refusing session from banned peer");
            return false;
        }
        entry.state = SwarmState::Active;
        entry.peer_id = Some(peer_id);
        true
    }

    pub fn session_closed(&mut self, addr: SocketAddr, failed: bool) {
        if let Some(entry) = self.entries.get_mut(&addr) {
            if entry.state != SwarmState::Banned {
                entry.state = SwarmState::Stored;
            }
            if failed {
                entry.failures += 1;
            }
        }
    }

    /// Bumps the failure counter without touching the session state. Used
    /// for misbehavior detected while the session is still being torn down.
    pub fn mark_failed(&mut self, addr: SocketAddr) {
        if let Some(entry) = self.entries.get_mut(&addr) {
            entry.failures += 1;
        }
    }

    pub fn dial_failed(&mut self, addr: SocketAddr) {
        if let Some(entry) = self.entries.get_mut(&addr) {
            if entry.state != SwarmState::Banned {
                entry.state = SwarmState::Stored;
            }
            entry.failures += 1;
        }
    }

    pub fn credit_transfer(&mut self, addr: SocketAddr, downloaded: u64, uploaded: u64) {
        if let Some(entry) = self.entries.get_mut(&addr) {
            entry.downloaded += downloaded;
            entry.uploaded += uploaded;
        }
    }

    /// Bumps the digest-blame counter, banning past the threshold. Returns
    /// the new count.
    pub fn record_hash_failure(&mut self, addr: SocketAddr, ban_threshold: u32) -> u32 {
        let Some(entry) = self.entries.get_mut(&addr) else {
            return 0;
        };
        entry.hash_failures += 1;
        if entry.hash_failures >= ban_threshold && entry.ban.is_none() {
            entry.state = SwarmState::Banned;
            entry.ban = Some(BanReason::HashFailures);
            tracing::info!(%addr, count = entry.hash_failures, "Banning peer for digest failures");
        }
        entry.hash_failures
    }

    pub fn ban(&mut self, addr: SocketAddr, reason: BanReason) {
        let entry = match self.entries.get_mut(&addr) {
            Some(entry) => entry,
            None => {
                self.add(addr, PeerSource::Manual);
                self.entries.get_mut(&addr).expect("just inserted")
            }
        };
        if entry.ban.is_none() {
            tracing::info!(%addr, %reason, "Banning peer");
        }
        entry.state = SwarmState::Banned;
        entry.ban = Some(reason);
    }

    pub fn set_local_addr(&mut self, addr: SocketAddr) {
        self.local_addr = Some(addr);
        for entry in self.entries.values_mut() {
            entry.priority = canonical_priority(addr, entry.addr);
        }
    }
}

/// BEP 40 canonical peer priority: a crc32-c over the masked, ordered
/// endpoint pair, so both sides rank the connection identically.
pub fn canonical_priority(mut a: SocketAddr, mut b: SocketAddr) -> u32 {
    let mut hasher = crc32c::Crc32cHasher::new(Default::default());
    if a.ip() == b.ip() {
        if a.port() > b.port() {
            std::mem::swap(&mut a, &mut b);
        }
        hasher.write_u16(a.port());
        hasher.write_u16(b.port());
        return hasher.finish() as u32;
    }
    match (a, b) {
        (SocketAddr::V4(mut a), SocketAddr::V4(mut b)) => {
            if a > b {
                std::mem::swap(&mut a, &mut b);
            }
            let mut oa = a.ip().octets();
            let mut ob = b.ip().octets();
            let mask: [u8; 4] = if oa[..2] != ob[..2] {
                [0xff, 0xff, 0x55, 0x55]
            } else if oa[..3] != ob[..3] {
                [0xff, 0xff, 0xff, 0x55]
            } else {
                [0xff; 4]
            };
            for i in 0..4 {
                oa[i] &= mask[i];
                ob[i] &= mask[i];
            }
            hasher.write(&oa);
            hasher.write(&ob);
            hasher.finish() as u32
        }
        (SocketAddr::V6(mut a), SocketAddr::V6(mut b)) => {
            if a > b {
                std::mem::swap(&mut a, &mut b);
            }
            let mut oa = a.ip().octets();
            let mut ob = b.ip().octets();
            let mut boundary = 0xff;
            for i in 0..oa.len() {
                if boundary == 0xff && oa[i] != ob[i] {
                    boundary = (i + 1).max(5);
                } else if i > boundary {
                    oa[i] &= 0x55;
                    ob[i] &= 0x55;
                }
            }
            hasher.write(&oa);
            hasher.write(&ob);
            hasher.finish() as u32
        }
        _ => {
            tracing::error!("Cannot rank a mixed v4/v6 endpoint pair");
            0
        }
    }
}
