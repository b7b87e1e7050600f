//! Protocol-level decoding errors.

use thiserror::Error;

use crate::prelude::String;

/// Errors produced while decoding TDS wire structures.
///
/// This crate is IO-agnostic: every variant describes a malformed or
/// truncated byte sequence, never a transport failure. Transport and
/// framing failures are the concern of `mssql-codec::CodecError`.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ProtocolError {
    /// Buffer did not contain enough bytes to decode a fixed-size structure.
    #[error("incomplete packet: expected {expected} bytes, got {actual}")]
    IncompletePacket {
        /// Number of bytes required.
        expected: usize,
        /// Number of bytes actually available.
        actual: usize,
    },

    /// Ran out of input while decoding a variable-length field.
    #[error("unexpected end of buffer")]
    UnexpectedEof,

    /// An enum discriminant byte did not match any known packet type.
    #[error("invalid packet type: 0x{0:02x}")]
    InvalidPacketType(u8),

    /// An enum discriminant byte did not match any known packet status.
    #[error("invalid packet status: 0x{0:02x}")]
    InvalidPacketStatus(u8),

    /// An enum discriminant byte did not match any known PRELOGIN option.
    #[error("invalid PRELOGIN option: 0x{0:02x}")]
    InvalidPreloginOption(u8),

    /// A token marker byte did not match any known or handleable token type.
    #[error("invalid or unhandled token type: 0x{0:02x}")]
    InvalidTokenType(u8),

    /// A UCS-2/UTF-16 byte sequence could not be decoded.
    #[error("string encoding error: {0}")]
    StringEncoding(String),

    /// A ROW or NBCROW token arrived without a preceding COLMETADATA.
    #[error("row data arrived without column metadata")]
    MissingColumnMetadata,
}
