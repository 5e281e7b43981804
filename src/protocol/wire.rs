//! Length-prefixed message framing.
//!
//! Every message is `<u32 length><u8 id><payload>`; a zero length frame is a
//! keep-alive. PIECE payloads are handed out as [`Bytes`] slices of the
//! receive buffer so block data reaches the piece buffer without an
//! intermediate copy.

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::BLOCK_LENGTH;

use super::ExtensionHandshake;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece: u32,
    },
    /// Raw payload; validated against the piece count where it is known.
    Bitfield {
        raw: Bytes,
    },
    Request {
        piece: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        piece: u32,
        begin: u32,
        data: Bytes,
    },
    Cancel {
        piece: u32,
        begin: u32,
        length: u32,
    },
    ExtensionHandshake {
        payload: ExtensionHandshake,
    },
    Extension {
        id: u8,
        payload: Bytes,
    },
}

mod id {
    pub const CHOKE: u8 = 0;
    pub const UNCHOKE: u8 = 1;
    pub const INTERESTED: u8 = 2;
    pub const NOT_INTERESTED: u8 = 3;
    pub const HAVE: u8 = 4;
    pub const BITFIELD: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const PIECE: u8 = 7;
    pub const CANCEL: u8 = 8;
    pub const EXTENDED: u8 = 20;
}

impl std::fmt::Display for WireMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireMessage::KeepAlive => write!(f, "KeepAlive"),
            WireMessage::Choke => write!(f, "Choke"),
            WireMessage::Unchoke => write!(f, "Unchoke"),
            WireMessage::Interested => write!(f, "Interested"),
            WireMessage::NotInterested => write!(f, "NotInterested"),
            WireMessage::Have { piece } => write!(f, "Have {piece}"),
            WireMessage::Bitfield { raw } => write!(f, "Bitfield of {} bytes", raw.len()),
            WireMessage::Request {
                piece,
                begin,
                length,
            } => write!(f, "Request {piece}:{begin}+{length}"),
            WireMessage::Piece { piece, begin, data } => {
                write!(f, "Piece {piece}:{begin}+{}", data.len())
            }
            WireMessage::Cancel {
                piece,
                begin,
                length,
            } => write!(f, "Cancel {piece}:{begin}+{length}"),
            WireMessage::ExtensionHandshake { .. } => write!(f, "ExtensionHandshake"),
            WireMessage::Extension { id, .. } => write!(f, "Extension {id}"),
        }
    }
}

impl WireMessage {
    fn parse(frame: Bytes) -> anyhow::Result<Self> {
        if frame.is_empty() {
            return Ok(Self::KeepAlive);
        }
        let tag = frame[0];
        let payload = &frame[1..];
        let triple = |p: &[u8]| -> anyhow::Result<(u32, u32, u32)> {
            if p.len() != 12 {
                bail!("expected 12 payload bytes, got {}", p.len());
            }
            Ok((
                u32::from_be_bytes(p[0..4].try_into().unwrap()),
                u32::from_be_bytes(p[4..8].try_into().unwrap()),
                u32::from_be_bytes(p[8..12].try_into().unwrap()),
            ))
        };
        match tag {
            id::CHOKE => Ok(Self::Choke),
            id::UNCHOKE => Ok(Self::Unchoke),
            id::INTERESTED => Ok(Self::Interested),
            id::NOT_INTERESTED => Ok(Self::NotInterested),
            id::HAVE => {
                if payload.len() != 4 {
                    bail!("HAVE payload is {} bytes", payload.len());
                }
                Ok(Self::Have {
                    piece: u32::from_be_bytes(payload.try_into().unwrap()),
                })
            }
            id::BITFIELD => Ok(Self::Bitfield {
                raw: frame.slice(1..),
            }),
            id::REQUEST => {
                let (piece, begin, length) = triple(payload)?;
                Ok(Self::Request {
                    piece,
                    begin,
                    length,
                })
            }
            id::PIECE => {
                if payload.len() < 8 {
                    bail!("PIECE payload is {} bytes", payload.len());
                }
                let piece = u32::from_be_bytes(payload[0..4].try_into().unwrap());
                let begin = u32::from_be_bytes(payload[4..8].try_into().unwrap());
                // zero-copy view into the frame
                Ok(Self::Piece {
                    piece,
                    begin,
                    data: frame.slice(9..),
                })
            }
            id::CANCEL => {
                let (piece, begin, length) = triple(payload)?;
                Ok(Self::Cancel {
                    piece,
                    begin,
                    length,
                })
            }
            id::EXTENDED => {
                if payload.is_empty() {
                    bail!("extended message without an id byte");
                }
                if payload[0] == 0 {
                    Ok(Self::ExtensionHandshake {
                        payload: ExtensionHandshake::from_bytes(&payload[1..])?,
                    })
                } else {
                    Ok(Self::Extension {
                        id: payload[0],
                        payload: frame.slice(2..),
                    })
                }
            }
            tag => Err(anyhow!("unknown message id {tag}")),
        }
    }
}

#[derive(Debug, Default)]
pub struct MessageCodec;

/// Largest frame we accept: a full block plus the PIECE header, with some
/// slack for large bitfields and extension dictionaries.
const MAX_FRAME: usize = BLOCK_LENGTH as usize + (1 << 15);

impl Decoder for MessageCodec {
    type Item = WireMessage;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes(src[..4].try_into().unwrap()) as usize;
        if length > MAX_FRAME {
            bail!("frame of {length} bytes exceeds the {MAX_FRAME} byte limit");
        }
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(4 + length);
        frame.advance(4);
        Ok(Some(WireMessage::parse(frame.freeze())?))
    }
}

impl Encoder<WireMessage> for MessageCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: WireMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let put_header = |dst: &mut BytesMut, payload_len: usize, tag: u8| {
            dst.reserve(4 + 1 + payload_len);
            dst.put_u32(1 + payload_len as u32);
            dst.put_u8(tag);
        };
        match item {
            WireMessage::KeepAlive => {
                dst.reserve(4);
                dst.put_u32(0);
            }
            WireMessage::Choke => put_header(dst, 0, id::CHOKE),
            WireMessage::Unchoke => put_header(dst, 0, id::UNCHOKE),
            WireMessage::Interested => put_header(dst, 0, id::INTERESTED),
            WireMessage::NotInterested => put_header(dst, 0, id::NOT_INTERESTED),
            WireMessage::Have { piece } => {
                put_header(dst, 4, id::HAVE);
                dst.put_u32(piece);
            }
            WireMessage::Bitfield { raw } => {
                put_header(dst, raw.len(), id::BITFIELD);
                dst.extend_from_slice(&raw);
            }
            WireMessage::Request {
                piece,
                begin,
                length,
            } => {
                put_header(dst, 12, id::REQUEST);
                dst.put_u32(piece);
                dst.put_u32(begin);
                dst.put_u32(length);
            }
            WireMessage::Piece { piece, begin, data } => {
                put_header(dst, 8 + data.len(), id::PIECE);
                dst.put_u32(piece);
                dst.put_u32(begin);
                dst.extend_from_slice(&data);
            }
            WireMessage::Cancel {
                piece,
                begin,
                length,
            } => {
                put_header(dst, 12, id::CANCEL);
                dst.put_u32(piece);
                dst.put_u32(begin);
                dst.put_u32(length);
            }
            WireMessage::ExtensionHandshake { payload } => {
                let raw = payload.to_bytes()?;
                put_header(dst, 1 + raw.len(), id::EXTENDED);
                dst.put_u8(0);
                dst.extend_from_slice(&raw);
            }
            WireMessage::Extension { id: ext_id, payload } => {
                put_header(dst, 1 + payload.len(), id::EXTENDED);
                dst.put_u8(ext_id);
                dst.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}
