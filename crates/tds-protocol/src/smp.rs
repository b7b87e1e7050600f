//! SMP (Session Multiplexing Protocol) packet header definitions.
//!
//! When MARS is negotiated during PRELOGIN, the physical TDS connection
//! carries more than one logical session. Each physical packet is prefixed
//! with a 16-byte SMP header that identifies which logical session the
//! enclosed TDS packet belongs to and carries the flow-control bookkeeping
//! (sequence number, window) for that session.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// SMP header size in bytes.
pub const SMP_HEADER_SIZE: usize = 16;

/// The fixed SMID byte that begins every SMP header.
pub const SMP_SMID: u8 = 0x53;

bitflags! {
    /// SMP control flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SmpFlags: u8 {
        /// Session establishment request/response.
        const SYN = 0x01;
        /// Acknowledgment of a SYN or FIN.
        const ACK = 0x02;
        /// Session teardown request/response.
        const FIN = 0x04;
        /// Packet carries a fragment of an enclosed TDS packet.
        const DATA = 0x08;
    }
}

/// Header prefixed to every packet multiplexed over an SMP connection.
///
/// Unlike [`crate::packet::PacketHeader`], which frames a single logical
/// TDS connection, the SMP header frames a *physical* connection shared by
/// several logical ones: `session_id` says which logical session a frame
/// belongs to, and `sequence_number`/`window` carry that session's
/// flow-control state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmpHeader {
    /// Control flags (SYN, ACK, FIN, or DATA).
    pub flags: SmpFlags,
    /// Logical session this frame belongs to.
    pub session_id: u16,
    /// Total length of this frame including the 16-byte header.
    pub length: u32,
    /// Sequence number of this frame within its session.
    pub sequence_number: u32,
    /// Receive window size, in frames, advertised for this session.
    pub window: u32,
}

impl SmpHeader {
    /// Build a SYN frame opening a new logical session.
    #[must_use]
    pub const fn syn(session_id: u16, window: u32) -> Self {
        Self {
            flags: SmpFlags::SYN,
            session_id,
            length: SMP_HEADER_SIZE as u32,
            sequence_number: 0,
            window,
        }
    }

    /// Build an ACK frame acknowledging a SYN or FIN.
    #[must_use]
    pub const fn ack(session_id: u16, sequence_number: u32, window: u32) -> Self {
        Self {
            flags: SmpFlags::ACK,
            session_id,
            length: SMP_HEADER_SIZE as u32,
            sequence_number,
            window,
        }
    }

    /// Build a FIN frame closing a logical session.
    #[must_use]
    pub const fn fin(session_id: u16, sequence_number: u32, window: u32) -> Self {
        Self {
            flags: SmpFlags::FIN,
            session_id,
            length: SMP_HEADER_SIZE as u32,
            sequence_number,
            window,
        }
    }

    /// Build a DATA frame header for `payload_len` bytes of enclosed TDS data.
    #[must_use]
    pub const fn data(session_id: u16, sequence_number: u32, window: u32, payload_len: u32) -> Self {
        Self {
            flags: SmpFlags::DATA,
            session_id,
            length: SMP_HEADER_SIZE as u32 + payload_len,
            sequence_number,
            window,
        }
    }

    /// Parse an SMP header from bytes.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < SMP_HEADER_SIZE {
            return Err(ProtocolError::IncompletePacket {
                expected: SMP_HEADER_SIZE,
                actual: src.remaining(),
            });
        }

        let smid = src.get_u8();
        if smid != SMP_SMID {
            return Err(ProtocolError::InvalidPacketType(smid));
        }
        let flags_byte = src.get_u8();
        let flags = SmpFlags::from_bits(flags_byte).ok_or(ProtocolError::InvalidPacketStatus(flags_byte))?;
        let session_id = src.get_u16_le();
        let length = src.get_u32_le();
        let sequence_number = src.get_u32_le();
        let window = src.get_u32_le();

        Ok(Self {
            flags,
            session_id,
            length,
            sequence_number,
            window,
        })
    }

    /// Encode the SMP header to bytes.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(SMP_SMID);
        dst.put_u8(self.flags.bits());
        dst.put_u16_le(self.session_id);
        dst.put_u32_le(self.length);
        dst.put_u32_le(self.sequence_number);
        dst.put_u32_le(self.window);
    }

    /// Encode the SMP header to a new `Bytes` buffer.
    #[must_use]
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SMP_HEADER_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Length of the enclosed payload, excluding this header.
    #[must_use]
    pub const fn payload_length(&self) -> usize {
        self.length.saturating_sub(SMP_HEADER_SIZE as u32) as usize
    }

    /// Whether this frame carries enclosed TDS data.
    #[must_use]
    pub const fn is_data(&self) -> bool {
        self.flags.contains(SmpFlags::DATA)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_syn_roundtrip() {
        let header = SmpHeader::syn(3, 4);
        let bytes = header.encode_to_bytes();
        assert_eq!(bytes.len(), SMP_HEADER_SIZE);
        assert_eq!(bytes[0], SMP_SMID);

        let mut cursor = bytes.as_ref();
        let decoded = SmpHeader::decode(&mut cursor).unwrap();
        assert_eq!(header, decoded);
        assert!(decoded.flags.contains(SmpFlags::SYN));
    }

    #[test]
    fn test_data_header_payload_length() {
        let header = SmpHeader::data(1, 7, 4, 128);
        assert_eq!(header.payload_length(), 128);
        assert!(header.is_data());
    }

    #[test]
    fn test_rejects_wrong_smid() {
        let mut bytes = SmpHeader::syn(1, 4).encode_to_bytes().to_vec();
        bytes[0] = 0x00;
        let mut cursor = bytes.as_slice();
        assert!(SmpHeader::decode(&mut cursor).is_err());
    }

    #[test]
    fn test_incomplete_header() {
        let short = [0u8; 10];
        let mut cursor = &short[..];
        assert!(matches!(
            SmpHeader::decode(&mut cursor),
            Err(ProtocolError::IncompletePacket { expected: SMP_HEADER_SIZE, actual: 10 })
        ));
    }
}
