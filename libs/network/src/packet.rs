//! Tagged Packets
//!
//! The unit every backend moves between processes. A packet carries a
//! one-byte tag so the receiver can dispatch before looking at the body:
//!
//! ```text
//! ┌──────────┬────────────────┬──────────────────────────────────┐
//! │ tag: u8  │ source: u32 BE │ body                             │
//! └──────────┴────────────────┴──────────────────────────────────┘
//!
//! token body:   [place_index u32 LE][net_id u32 LE][tokens_count u32 LE][payload]
//! service body: bincode-encoded control message
//! ```
//!
//! Token payloads stay opaque: the network layer never looks past the
//! fixed header.

use crate::{Result, TransportError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tag value for token deliveries
pub const TAG_TOKENS: u8 = 0;
/// Tag value for service/control messages
pub const TAG_SERVICE: u8 = 1;

/// Size of the reserved token header in front of every token payload
pub const TOKENS_HEADER_LEN: usize = 12;

/// Size of the tag + source prefix inside a TCP frame
pub const FRAME_PREFIX_LEN: usize = 5;

/// Index of a process inside the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessId(u32);

impl ProcessId {
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Wire tag selecting how a packet body is decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Tag {
    Tokens = TAG_TOKENS,
    Service = TAG_SERVICE,
}

impl TryFrom<u8> for Tag {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            TAG_TOKENS => Ok(Tag::Tokens),
            TAG_SERVICE => Ok(Tag::Service),
            other => Err(TransportError::protocol(format!("Unknown packet tag {}", other))),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Tokens => f.write_str("tokens"),
            Tag::Service => f.write_str("service"),
        }
    }
}

/// Fixed header in front of every token payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokensHeader {
    pub place_index: u32,
    pub net_id: u32,
    pub tokens_count: u32,
}

/// A tagged buffer travelling between two processes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub tag: Tag,
    pub source: ProcessId,
    pub body: Bytes,
}

impl Packet {
    pub fn new(tag: Tag, source: ProcessId, body: Bytes) -> Self {
        Self { tag, source, body }
    }

    /// Build a token-delivery packet; the payload is copied behind the header
    pub fn tokens(source: ProcessId, header: TokensHeader, payload: &[u8]) -> Self {
        let mut body = BytesMut::with_capacity(TOKENS_HEADER_LEN + payload.len());
        body.put_u32_le(header.place_index);
        body.put_u32_le(header.net_id);
        body.put_u32_le(header.tokens_count);
        body.put_slice(payload);
        Self::new(Tag::Tokens, source, body.freeze())
    }

    /// Build a service packet from an already encoded control message
    pub fn service(source: ProcessId, body: Bytes) -> Self {
        Self::new(Tag::Service, source, body)
    }

    /// Split a token packet into its header and the opaque payload
    pub fn decode_tokens(&self) -> Result<(TokensHeader, Bytes)> {
        if self.tag != Tag::Tokens {
            return Err(TransportError::protocol(format!(
                "Expected tokens packet, got {}",
                self.tag
            )));
        }
        if self.body.len() < TOKENS_HEADER_LEN {
            return Err(TransportError::protocol(format!(
                "Token packet too short: {} bytes",
                self.body.len()
            )));
        }
        let mut header = &self.body[..TOKENS_HEADER_LEN];
        let header = TokensHeader {
            place_index: header.get_u32_le(),
            net_id: header.get_u32_le(),
            tokens_count: header.get_u32_le(),
        };
        Ok((header, self.body.slice(TOKENS_HEADER_LEN..)))
    }

    /// Bytes this packet occupies on the wire (without the length prefix)
    pub fn wire_len(&self) -> usize {
        FRAME_PREFIX_LEN + self.body.len()
    }

    /// Append the length-prefixed frame for this packet to `buf`
    pub fn encode_frame(&self, buf: &mut BytesMut) {
        buf.reserve(4 + self.wire_len());
        buf.put_u32(self.wire_len() as u32);
        buf.put_u8(self.tag as u8);
        buf.put_u32(self.source.raw());
        buf.put_slice(&self.body);
    }

    /// Decode a frame whose length prefix has already been stripped
    pub fn decode_frame(mut frame: Bytes) -> Result<Self> {
        if frame.len() < FRAME_PREFIX_LEN {
            return Err(TransportError::protocol(format!(
                "Frame too short: {} bytes",
                frame.len()
            )));
        }
        let tag = Tag::try_from(frame.get_u8())?;
        let source = ProcessId::new(frame.get_u32());
        Ok(Self::new(tag, source, frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_header_layout() {
        let packet = Packet::tokens(
            ProcessId::new(1),
            TokensHeader {
                place_index: 3,
                net_id: 7,
                tokens_count: 2,
            },
            b"ab",
        );
        assert_eq!(packet.tag, Tag::Tokens);
        assert_eq!(&packet.body[..4], &3u32.to_le_bytes());
        assert_eq!(&packet.body[4..8], &7u32.to_le_bytes());
        assert_eq!(&packet.body[8..12], &2u32.to_le_bytes());
        assert_eq!(&packet.body[12..], b"ab");

        let (header, payload) = packet.decode_tokens().unwrap();
        assert_eq!(header.net_id, 7);
        assert_eq!(header.tokens_count, 2);
        assert_eq!(&payload[..], b"ab");
    }

    #[test]
    fn test_decode_tokens_rejects_service_packet() {
        let packet = Packet::service(ProcessId::new(0), Bytes::from_static(b"xyz"));
        assert!(packet.decode_tokens().is_err());
    }

    #[test]
    fn test_short_token_packet_is_protocol_error() {
        let packet = Packet::new(Tag::Tokens, ProcessId::new(0), Bytes::from_static(&[1, 2, 3]));
        let err = packet.decode_tokens().unwrap_err();
        assert_eq!(err.category(), "protocol");
    }

    #[test]
    fn test_frame_prefix_and_decode() {
        let packet = Packet::service(ProcessId::new(4), Bytes::from_static(b"quit"));
        let mut buf = BytesMut::new();
        packet.encode_frame(&mut buf);

        assert_eq!(&buf[..4], &(packet.wire_len() as u32).to_be_bytes());
        assert_eq!(buf[4], TAG_SERVICE);

        let decoded = Packet::decode_frame(buf.freeze().slice(4..)).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_unknown_tag() {
        assert!(Tag::try_from(9).is_err());
        let frame = Bytes::from_static(&[9, 0, 0, 0, 1]);
        assert!(Packet::decode_frame(frame).is_err());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn decode_frame_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
                let _ = Packet::decode_frame(Bytes::from(bytes));
            }

            #[test]
            fn token_header_survives_framing(
                place in any::<u32>(),
                net in any::<u32>(),
                count in any::<u32>(),
                payload in proptest::collection::vec(any::<u8>(), 0..32),
            ) {
                let header = TokensHeader { place_index: place, net_id: net, tokens_count: count };
                let packet = Packet::tokens(ProcessId::new(2), header, &payload);
                let mut buf = BytesMut::new();
                packet.encode_frame(&mut buf);
                let decoded = Packet::decode_frame(buf.freeze().slice(4..)).unwrap();
                let (decoded_header, decoded_payload) = decoded.decode_tokens().unwrap();
                prop_assert_eq!(decoded_header, header);
                prop_assert_eq!(&decoded_payload[..], &payload[..]);
            }
        }
    }
}
