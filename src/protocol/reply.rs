//! Reply framing.
//!
//! Replies are length-framed in the format complementary to the request
//! header: a fixed reply header followed by `size` payload bytes. The
//! payload is whatever the handler produced; this layer only stamps the
//! correlation id and frames it.

use bytes::Bytes;

use crate::protocol::PROTOCOL_VERSION;

/// Size in bytes of the fixed reply header on the wire.
pub const REPLY_HEADER_SIZE: usize = 14;

/// Fixed-width header at the start of every reply.
///
/// Wire layout, little-endian: version (u8), flags (u8), size (u32),
/// correlation_id (u32), checksum (u32, CRC32 over the preceding 10
/// bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub version: u8,
    pub flags: u8,
    /// Payload length in bytes.
    pub size: u32,
    /// Echoed from the request header.
    pub correlation_id: u32,
}

impl ReplyHeader {
    /// Decodes a reply header, returning `None` on a failed integrity
    /// check or unsupported version.
    pub fn decode(buf: &[u8; REPLY_HEADER_SIZE]) -> Option<Self> {
        let checksum = u32::from_le_bytes(buf[10..14].try_into().expect("slice is 4 bytes"));
        if checksum != crc32fast::hash(&buf[..10]) {
            return None;
        }
        let version = buf[0];
        if version != PROTOCOL_VERSION {
            return None;
        }
        Some(Self {
            version,
            flags: buf[1],
            size: u32::from_le_bytes(buf[2..6].try_into().expect("slice is 4 bytes")),
            correlation_id: u32::from_le_bytes(buf[6..10].try_into().expect("slice is 4 bytes")),
        })
    }

    pub fn encode(&self) -> [u8; REPLY_HEADER_SIZE] {
        let mut buf = [0u8; REPLY_HEADER_SIZE];
        buf[0] = self.version;
        buf[1] = self.flags;
        buf[2..6].copy_from_slice(&self.size.to_le_bytes());
        buf[6..10].copy_from_slice(&self.correlation_id.to_le_bytes());
        let checksum = crc32fast::hash(&buf[..10]);
        buf[10..14].copy_from_slice(&checksum.to_le_bytes());
        buf
    }
}

/// Scatter-gather reply buffer produced by a method handler.
///
/// Handlers append payload segments without copying; the dispatch machinery
/// stamps the request's correlation id and writes the frame out as one
/// vectored write. The correlation id is never set by the handler.
#[derive(Debug, Default)]
pub struct ReplyBuf {
    flags: u8,
    correlation_id: u32,
    segments: Vec<Bytes>,
}

impl ReplyBuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a reply with a single payload segment.
    pub fn from_payload(payload: impl Into<Bytes>) -> Self {
        let mut buf = Self::new();
        buf.append(payload);
        buf
    }

    /// Appends a payload segment. Empty segments are dropped.
    pub fn append(&mut self, segment: impl Into<Bytes>) {
        let segment = segment.into();
        if !segment.is_empty() {
            self.segments.push(segment);
        }
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.flags = flags;
    }

    pub fn segments(&self) -> &[Bytes] {
        &self.segments
    }

    /// Total payload length across all segments.
    pub fn payload_len(&self) -> usize {
        self.segments.iter().map(Bytes::len).sum()
    }

    pub(crate) fn set_correlation_id(&mut self, correlation_id: u32) {
        self.correlation_id = correlation_id;
    }

    /// Encodes the frame header for the current payload.
    pub(crate) fn header_bytes(&self) -> [u8; REPLY_HEADER_SIZE] {
        ReplyHeader {
            version: PROTOCOL_VERSION,
            flags: self.flags,
            size: self.payload_len() as u32,
            correlation_id: self.correlation_id,
        }
        .encode()
    }
}
