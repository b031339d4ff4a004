//! Error taxonomy for the endpoint core.

use std::{io, str::Utf8Error, string::FromUtf8Error};

use thiserror::Error;

use crate::protocol::frame::CloseCode;

/// Convenience alias for results produced by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    /// The close handshake completed and the connection is gone.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The connection was already closed when the operation was attempted.
    #[error("Connection already closed")]
    AlreadyClosed,

    /// The endpoint is not in the OPEN state.
    #[error("Endpoint is not open")]
    NotOpen,

    /// Transport failure.
    #[error("I/O Error: {0}")]
    Io(#[from] io::Error),

    /// Peer violated the framing protocol.
    #[error("Protocol Error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Payload declared as text is not valid UTF-8.
    #[error("UTF-8 Error: {0}")]
    Utf8(String),

    /// A configured size limit was exceeded.
    #[error("Capacity Error: {0}")]
    Capacity(#[from] CapacityError),

    /// Extension negotiation or codec failure.
    #[error("Extension Error: {0}")]
    Extension(#[from] ExtensionError),
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Error::Utf8(value.to_string())
    }
}

impl From<FromUtf8Error> for Error {
    fn from(value: FromUtf8Error) -> Self {
        Error::Utf8(value.to_string())
    }
}

impl Error {
    /// The close code this error translates to on the wire.
    ///
    /// `None` for errors that never produce a close frame: I/O failures end
    /// the connection abnormally with the local-only 1006, and lifecycle
    /// errors are surfaced to the caller without touching the wire.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Error::Protocol(_) => Some(CloseCode::Protocol),
            Error::Utf8(_) => Some(CloseCode::Invalid),
            Error::Capacity(_) => Some(CloseCode::Size),
            Error::Extension(e) => e.close_code(),
            _ => None,
        }
    }
}

/// Violations of RFC 6455 framing rules.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum ProtocolError {
    /// A reserved bit was set without a negotiated extension claiming it.
    #[error("Encountered frame with non-zero reserved bits")]
    NonZeroReservedBits,

    /// RSV1 on a continuation frame; only the first frame of a message may
    /// carry the compression bit.
    #[error("Compression bit set on a continuation frame")]
    CompressedContinuationFrame,

    /// RSV1 set although permessage-deflate was not negotiated.
    #[error("Compression bit set without a negotiated extension")]
    CompressionNotNegotiated,

    /// Control frames must fit in a single frame.
    #[error("Control frame must not be fragmented")]
    FragmentedControlFrame,

    /// Control frame payloads are capped at 125 bytes.
    #[error("Control frame payload too large")]
    ControlFrameTooBig,

    /// A server received an unmasked data frame.
    #[error("Received unmasked frame from client")]
    UnmaskedFrameFromClient,

    /// A client received a masked data frame.
    #[error("Received masked frame from server")]
    MaskedFrameFromServer,

    /// Opcode in the reserved control range 0xB-0xF.
    #[error("Received unknown control opcode: {0}")]
    UnknownControlOpCode(u8),

    /// Opcode in the reserved data range 0x3-0x7.
    #[error("Received unknown data opcode: {0}")]
    UnknownDataOpCode(u8),

    /// Continuation frame without a message in progress.
    #[error("Received continue frame without open fragmentation context")]
    UnexpectedContinue,

    /// A new data frame arrived while another message was being assembled.
    #[error("Received new data frame while a message is in progress")]
    UnexpectedNewMessage,

    /// The 64-bit extended length had its most significant bit set.
    #[error("Payload length with reserved high bit set")]
    InvalidPayloadLength,

    /// Close frame payload of exactly one byte, or an otherwise undecodable
    /// close payload.
    #[error("Invalid close frame payload")]
    InvalidCloseFrame,

    /// Close code outside the set a peer may send.
    #[error("Close code {0} is not allowed from the peer")]
    DisallowedCloseCode(u16),

    /// A data or control send was attempted after the close handshake began.
    #[error("Sent after close handshake started")]
    SendAfterClose,

    /// The socket ended without a close handshake.
    #[error("Connection closed without proper handshake")]
    ResetWithoutClosing,

    /// The sender was asked to continue a fragmented message that was never
    /// started, or to start one while another is active.
    #[error("Fragmented send out of sequence")]
    FragmentOutOfSequence,
}

/// Configured limits exceeded.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum CapacityError {
    /// Message grew past the configured maximum payload size.
    #[error("Payload too large: {size} > {max}")]
    MessageTooLarge {
        /// Observed (or declared) size.
        size: usize,
        /// Configured cap.
        max: usize,
    },

    /// A single message arrived in more continuation frames than allowed.
    #[error("Too many continuation frames")]
    TooManyContinuationFrames,
}

/// Failures in `Sec-WebSocket-Extensions` handling and the deflate codec.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ExtensionError {
    /// The extension header did not match the offer grammar.
    #[error("Malformed extension header: {0}")]
    MalformedHeader(String),

    /// An offer carried a parameter this implementation does not know.
    #[error("Unknown extension parameter: {0}")]
    UnknownParameter(String),

    /// The same parameter appeared twice in one offer.
    #[error("Duplicate extension parameter: {0}")]
    DuplicateParameter(String),

    /// A parameter value failed validation.
    #[error("Invalid value for {name}: {value}")]
    InvalidParameterValue {
        /// Parameter name.
        name: String,
        /// Offending value (empty when the value was absent).
        value: String,
    },

    /// Window bits outside 8..=15.
    #[error("Window bits must be 8-15, got {0}")]
    InvalidWindowBits(String),

    /// The deflate stream could not be compressed.
    #[error("Compression failed: {0}")]
    Deflate(String),

    /// The peer's compressed payload could not be inflated.
    #[error("Decompression failed: {0}")]
    Inflate(String),
}

impl ExtensionError {
    fn close_code(&self) -> Option<CloseCode> {
        match self {
            // Runtime codec failures map to "invalid payload data".
            ExtensionError::Deflate(_) | ExtensionError::Inflate(_) => Some(CloseCode::Invalid),
            // Negotiation failures happen before the endpoint opens and
            // reject the upgrade instead of closing a connection.
            _ => None,
        }
    }
}
