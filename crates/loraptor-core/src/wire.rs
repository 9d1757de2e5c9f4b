//! LoRaptor wire format: addressing and the mesh frame header.
//!
//! The encrypted envelope (see `envelope`) is opaque to the mesh. Every
//! frame the mesh carries is this fixed header followed by the envelope
//! bytes. Changing the header layout is a breaking change for every node
//! on the mesh.
//!
//! The header is #[repr(C)] with byte-array fields only, so it has no
//! padding and no alignment requirements. zerocopy derives give
//! allocation-free serialization without unsafe code.

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Addressing ────────────────────────────────────────────────────────────────

/// 16-bit mesh node address.
pub type NodeAddress = u16;

/// Destination address that every node accepts.
pub const BROADCAST_ADDR: NodeAddress = 0xFFFF;

/// Parse a node address written in decimal or `0x`-prefixed hex.
pub fn parse_address(text: &str) -> Result<NodeAddress, WireError> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => NodeAddress::from_str_radix(hex, 16),
        None => text.parse::<NodeAddress>(),
    };
    parsed.map_err(|_| WireError::InvalidAddress(text.to_string()))
}

// ── Frame Header ──────────────────────────────────────────────────────────────

/// Header preceding every envelope on the mesh.
///
/// Wire size: 6 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct FrameHeader {
    /// Frame format version. Currently 0x01.
    /// A receiver seeing an unknown version silently drops the frame.
    pub version: u8,

    /// Reserved, must be zero.
    pub flags: u8,

    /// Destination node address, big-endian. `BROADCAST_ADDR` for everyone.
    pub dest: [u8; 2],

    /// Source node address, big-endian.
    pub src: [u8; 2],
}

assert_eq_size!(FrameHeader, [u8; 6]);

impl FrameHeader {
    pub fn new(src: NodeAddress, dest: NodeAddress) -> Self {
        Self {
            version: FRAME_VERSION,
            flags: 0,
            dest: dest.to_be_bytes(),
            src: src.to_be_bytes(),
        }
    }

    pub fn dest(&self) -> NodeAddress {
        NodeAddress::from_be_bytes(self.dest)
    }

    pub fn src(&self) -> NodeAddress {
        NodeAddress::from_be_bytes(self.src)
    }
}

/// Build a complete frame: header followed by the payload.
pub fn encode_frame(src: NodeAddress, dest: NodeAddress, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(WireError::PayloadTooLarge(payload.len()));
    }
    let header = FrameHeader::new(src, dest);
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Split a received frame into its header and payload.
pub fn decode_frame(bytes: &[u8]) -> Result<(FrameHeader, &[u8]), WireError> {
    let header = FrameHeader::read_from_prefix(bytes).ok_or(WireError::Truncated(bytes.len()))?;
    if header.version != FRAME_VERSION {
        return Err(WireError::UnknownVersion(header.version));
    }
    if header.flags != 0 {
        return Err(WireError::ReservedFlagsSet(header.flags));
    }
    let payload = &bytes[FRAME_HEADER_LEN..];
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(WireError::PayloadTooLarge(payload.len()));
    }
    Ok((header, payload))
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Current frame format version.
pub const FRAME_VERSION: u8 = 0x01;

/// Size of `FrameHeader` on the wire.
pub const FRAME_HEADER_LEN: usize = 6;

/// Maximum envelope bytes in a single frame.
pub const MAX_FRAME_PAYLOAD: usize = 2048;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame of {0} bytes is shorter than the header")]
    Truncated(usize),

    #[error("unknown frame version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("reserved flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),

    #[error("payload length {0} exceeds maximum {}", MAX_FRAME_PAYLOAD)]
    PayloadTooLarge(usize),

    #[error("invalid node address: {0:?}")]
    InvalidAddress(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
