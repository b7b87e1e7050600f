//! Errors produced by the packet framing and connection layer.

use thiserror::Error;

/// Errors that can occur while framing TDS packets over a byte stream.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A packet header claimed a total length shorter than the header itself.
    #[error("invalid packet header")]
    InvalidHeader,

    /// A packet header claimed a length larger than the configured maximum.
    #[error("packet too large: {size} bytes exceeds maximum of {max}")]
    PacketTooLarge {
        /// Size claimed by the packet header.
        size: usize,
        /// Configured maximum packet size.
        max: usize,
    },

    /// The underlying transport closed while a message was only partially assembled.
    #[error("connection closed mid-message")]
    ConnectionClosed,

    /// A packet's header or payload failed to decode.
    #[error(transparent)]
    Protocol(#[from] tds_protocol::ProtocolError),

    /// The underlying transport returned an I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
