//! Frame codec: the bit-exact wire layout described in the crate docs.

use crc::{CRC_32_ISO_HDLC, Crc, Table};

use crate::BROADCAST_ADDR;

const FRAME_CRC: Crc<u32, Table<1>> = Crc::<u32, Table<1>>::new(&CRC_32_ISO_HDLC);

/// Control word plus the two addresses.
const HEADER_LEN: usize = 6;
/// CRC-32 trailer.
const TRAILER_LEN: usize = 4;

/// Shortest well-formed frame: header and trailer, no payload.
pub const MIN_FRAME_LEN: usize = HEADER_LEN + TRAILER_LEN;
/// Largest frame the codec will produce.
pub const MAX_FRAME_LEN: usize = 2048;
/// Largest payload that fits in a frame.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - MIN_FRAME_LEN;

/// Sequence numbers occupy 12 bits of the control word.
pub const SEQ_MODULUS: u16 = 4096;

/// The frame types carried in the top three bits of the control word.
///
/// `Cts` and `Rts` are reserved: the codec round-trips them but nothing
/// in this crate emits or reacts to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data = 0,
    Ack = 1,
    Beacon = 2,
    Cts = 4,
    Rts = 5,
}

impl FrameType {
    pub const fn from_bits(bits: u8) -> Option<FrameType> {
        match bits {
            0 => Some(FrameType::Data),
            1 => Some(FrameType::Ack),
            2 => Some(FrameType::Beacon),
            4 => Some(FrameType::Cts),
            5 => Some(FrameType::Rts),
            _ => None,
        }
    }

    pub const fn bits(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum FrameDecodeError {
    /// Input shorter than a header plus trailer. The only structural
    /// error: anything of at least minimum length decodes, with the CRC
    /// verdict recorded in [`Frame::crc_ok`].
    TooShort { len: usize },
}

/// A parsed frame. Unknown type bits survive parsing ([`Frame::kind`]
/// returns `None` for them) so that a dispatcher can drop them itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind_bits: u8,
    pub retry: bool,
    pub seq: u16,
    pub dst: i16,
    pub src: i16,
    pub payload: Vec<u8>,
    pub crc_ok: bool,
}

impl Frame {
    /// Frame type, if the 3-bit value on the wire is one we know.
    pub fn kind(&self) -> Option<FrameType> {
        FrameType::from_bits(self.kind_bits)
    }

    pub fn kind_bits(&self) -> u8 {
        self.kind_bits
    }

    pub fn is_broadcast(&self) -> bool {
        self.dst == BROADCAST_ADDR
    }

    /// Build the wire bytes for a frame. `len` is clamped to the payload
    /// buffer and to [`MAX_PAYLOAD_LEN`]; `seq` wraps into its 12 bits.
    pub fn encode(
        kind: FrameType,
        retry: bool,
        src: i16,
        dst: i16,
        payload: &[u8],
        len: usize,
        seq: u16,
    ) -> Vec<u8> {
        let len = len.min(payload.len()).min(MAX_PAYLOAD_LEN);
        let control =
            ((kind.bits() as u16) << 13) | ((retry as u16) << 12) | (seq % SEQ_MODULUS);

        let mut buf = Vec::with_capacity(MIN_FRAME_LEN + len);
        buf.extend_from_slice(&control.to_be_bytes());
        buf.extend_from_slice(&(dst as u16).to_be_bytes());
        buf.extend_from_slice(&(src as u16).to_be_bytes());
        buf.extend_from_slice(&payload[..len]);

        let crc = FRAME_CRC.checksum(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Parse wire bytes. Never fails on garbage of sufficient length;
    /// the caller checks [`Frame::crc_ok`].
    pub fn decode(bytes: &[u8]) -> Result<Frame, FrameDecodeError> {
        if bytes.len() < MIN_FRAME_LEN {
            return Err(FrameDecodeError::TooShort { len: bytes.len() });
        }

        let control = u16::from_be_bytes([bytes[0], bytes[1]]);
        let body_end = bytes.len() - TRAILER_LEN;

        let mut crc_bytes = [0u8; TRAILER_LEN];
        crc_bytes.copy_from_slice(&bytes[body_end..]);
        let crc_ok = FRAME_CRC.checksum(&bytes[..body_end]) == u32::from_be_bytes(crc_bytes);

        Ok(Frame {
            kind_bits: (control >> 13) as u8,
            retry: control & 0x1000 != 0,
            seq: control & 0x0FFF,
            dst: u16::from_be_bytes([bytes[2], bytes[3]]) as i16,
            src: u16::from_be_bytes([bytes[4], bytes[5]]) as i16,
            payload: bytes[HEADER_LEN..body_end].to_vec(),
            crc_ok,
        })
    }
}

/// Encode a millisecond timestamp as a beacon payload, most significant
/// byte first.
pub fn timestamp_to_bytes(millis: i64) -> [u8; 8] {
    millis.to_be_bytes()
}

pub fn bytes_to_timestamp(bytes: &[u8; 8]) -> i64 {
    i64::from_be_bytes(*bytes)
}
