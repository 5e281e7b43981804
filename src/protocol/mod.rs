//! BitTorrent peer wire protocol: handshake, framed messages and the
//! extension-protocol envelope (BEP 10).

use std::collections::HashMap;

use anyhow::{ensure, Context};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::CLIENT_NAME;

pub mod wire;

const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Azureus-style local id: `-TE0100-` followed by random bytes.
    pub fn generate() -> Self {
        let mut id: [u8; 20] = rand::random();
        id[..8].copy_from_slice(b"-TE0100-");
        Self(id)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// The fixed 68-byte connection preamble.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: PeerId,
}

impl Handshake {
    pub const LENGTH: usize = 68;

    pub fn new(info_hash: [u8; 20], peer_id: PeerId) -> Self {
        let mut reserved = [0u8; 8];
        // advertise BEP 10 extension support
        reserved[5] |= 0x10;
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[5] & 0x10 != 0
    }

    pub fn to_bytes(&self) -> [u8; Self::LENGTH] {
        let mut out = [0u8; Self::LENGTH];
        out[0] = PROTOCOL_STRING.len() as u8;
        out[1..20].copy_from_slice(PROTOCOL_STRING);
        out[20..28].copy_from_slice(&self.reserved);
        out[28..48].copy_from_slice(&self.info_hash);
        out[48..68].copy_from_slice(&self.peer_id.0);
        out
    }

    pub fn from_bytes(raw: &[u8; Self::LENGTH]) -> anyhow::Result<Self> {
        ensure!(raw[0] as usize == PROTOCOL_STRING.len(), "bad pstr length");
        ensure!(&raw[1..20] == PROTOCOL_STRING, "unknown protocol string");
        let mut reserved = [0u8; 8];
        let mut info_hash = [0u8; 20];
        let mut peer_id = [0u8; 20];
        reserved.copy_from_slice(&raw[20..28]);
        info_hash.copy_from_slice(&raw[28..48]);
        peer_id.copy_from_slice(&raw[48..68]);
        Ok(Self {
            reserved,
            info_hash,
            peer_id: PeerId(peer_id),
        })
    }
}

/// BEP 10 extension handshake dictionary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtensionHandshake {
    #[serde(rename = "m")]
    pub dict: HashMap<String, u8>,
    #[serde(flatten)]
    pub fields: HashMap<String, serde_bencode::value::Value>,
}

impl ExtensionHandshake {
    pub fn from_bytes(bytes: &[u8]) -> serde_bencode::Result<Self> {
        serde_bencode::from_bytes(bytes)
    }

    pub fn to_bytes(&self) -> anyhow::Result<Bytes> {
        Ok(serde_bencode::to_bytes(self)
            .context("encode extension handshake")?
            .into())
    }

    /// Our side of the handshake: no extensions registered, but we publish
    /// the request queue depth and client version.
    pub fn ours(reqq: usize) -> Self {
        let mut fields = HashMap::new();
        fields.insert(
            "reqq".to_string(),
            serde_bencode::value::Value::Int(reqq as i64),
        );
        fields.insert(
            "v".to_string(),
            serde_bencode::value::Value::Bytes(CLIENT_NAME.as_bytes().to_vec()),
        );
        Self {
            dict: HashMap::new(),
            fields,
        }
    }

    /// The peer's advertised outstanding-request capacity.
    pub fn request_queue_limit(&self) -> Option<usize> {
        match self.fields.get("reqq")? {
            serde_bencode::value::Value::Int(size) => usize::try_from(*size).ok(),
            _ => None,
        }
    }

    /// Client name and version, more reliable than peer-id fingerprinting.
    pub fn client_name(&self) -> Option<&str> {
        match self.fields.get("v")? {
            serde_bencode::value::Value::Bytes(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }
}
