//! Error types for UVC wire-format encoding and decoding.

use thiserror::Error;

/// Errors produced while decoding or encoding UVC wire structures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Input shorter than the structure being decoded.
    #[error("Truncated {what}: expected at least {expected} bytes, got {actual}")]
    Truncated {
        /// Structure being decoded
        what: &'static str,
        /// Minimum byte count
        expected: usize,
        /// Actual byte count
        actual: usize,
    },

    /// Output buffer too small for the encoded structure.
    #[error("Buffer too small for {what}: need {needed} bytes, have {available}")]
    BufferTooSmall {
        /// Structure being encoded
        what: &'static str,
        /// Required byte count
        needed: usize,
        /// Available byte count
        available: usize,
    },

    /// `bRequest` is not a UVC class request code.
    #[error("Unknown UVC request code: {0:#04x}")]
    UnknownRequest(u8),

    /// Control selector not defined for the video streaming interface.
    #[error("Unknown video streaming control selector: {0:#04x}")]
    UnknownControlSelector(u8),

    /// Payload header length byte is inconsistent with the data.
    #[error("Invalid payload header length {length} (payload is {available} bytes)")]
    InvalidHeaderLength {
        /// Declared header length
        length: u8,
        /// Bytes actually present
        available: usize,
    },

    /// Payload header without the end-of-header bit.
    #[error("Payload header is missing the EOH bit (bitfield {0:#04x})")]
    MissingEndOfHeader(u8),

    /// Format/frame pair not advertised in the descriptor table.
    #[error("Unsupported format/frame index: format {format_index}, frame {frame_index}")]
    UnsupportedFormat {
        /// bFormatIndex
        format_index: u8,
        /// bFrameIndex
        frame_index: u8,
    },

    /// Malformed descriptor bytes.
    #[error("Malformed descriptor: {0}")]
    MalformedDescriptor(&'static str),
}

impl ProtocolError {
    /// Create a truncated-input error.
    #[must_use]
    pub fn truncated(what: &'static str, expected: usize, actual: usize) -> Self {
        Self::Truncated {
            what,
            expected,
            actual,
        }
    }

    /// Create a buffer-too-small error.
    #[must_use]
    pub fn buffer_too_small(what: &'static str, needed: usize, available: usize) -> Self {
        Self::BufferTooSmall {
            what,
            needed,
            available,
        }
    }

    /// Create an unsupported format/frame error.
    #[must_use]
    pub fn unsupported_format(format_index: u8, frame_index: u8) -> Self {
        Self::UnsupportedFormat {
            format_index,
            frame_index,
        }
    }
}

/// A specialized `Result` type for protocol operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
