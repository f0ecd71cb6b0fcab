//! Request header codec.

/// Protocol version stamped into every frame header.
pub const PROTOCOL_VERSION: u8 = 0;

/// Size in bytes of the fixed request header on the wire.
pub const HEADER_SIZE: usize = 18;

/// Fixed-width header at the start of every request.
///
/// Wire layout, little-endian:
///
/// | offset | field          | type |
/// |-------:|----------------|------|
/// | 0      | version        | u8   |
/// | 1      | flags          | u8   |
/// | 2      | meta           | u32  |
/// | 6      | size           | u32  |
/// | 10     | correlation_id | u32  |
/// | 14     | checksum       | u32  |
///
/// `meta` identifies the method to dispatch to, `size` is the body length
/// in bytes, and `checksum` is a CRC32 over the preceding 14 bytes. A
/// well-formed request is exactly `HEADER_SIZE + size` bytes of ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub flags: u8,
    /// Method id.
    pub meta: u32,
    /// Body length in bytes.
    pub size: u32,
    /// Opaque id echoed back in the reply.
    pub correlation_id: u32,
}

impl Header {
    /// Creates a header for the current protocol version with no flags set.
    pub fn new(meta: u32, size: u32, correlation_id: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags: 0,
            meta,
            size,
            correlation_id,
        }
    }

    /// Decodes a header from a raw buffer.
    ///
    /// Returns `None` when the buffer fails its integrity check or carries
    /// an unsupported version. Callers treat an absent result as a corrupt
    /// frame and decide policy themselves.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Option<Self> {
        let checksum = u32::from_le_bytes(buf[14..18].try_into().expect("slice is 4 bytes"));
        if checksum != crc32fast::hash(&buf[..14]) {
            return None;
        }
        let version = buf[0];
        if version != PROTOCOL_VERSION {
            return None;
        }
        Some(Self {
            version,
            flags: buf[1],
            meta: u32::from_le_bytes(buf[2..6].try_into().expect("slice is 4 bytes")),
            size: u32::from_le_bytes(buf[6..10].try_into().expect("slice is 4 bytes")),
            correlation_id: u32::from_le_bytes(buf[10..14].try_into().expect("slice is 4 bytes")),
        })
    }

    /// Encodes the header, computing the checksum field.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.version;
        buf[1] = self.flags;
        buf[2..6].copy_from_slice(&self.meta.to_le_bytes());
        buf[6..10].copy_from_slice(&self.size.to_le_bytes());
        buf[10..14].copy_from_slice(&self.correlation_id.to_le_bytes());
        let checksum = crc32fast::hash(&buf[..14]);
        buf[14..18].copy_from_slice(&checksum.to_le_bytes());
        buf
    }
}
