//! Error types for the protocol crate.

use thiserror::Error;

/// Failure decoding a channel request payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Not enough bytes for the 4-byte length prefix of a string.
    #[error("number of bytes is less than 4: {available}")]
    TruncatedLength {
        /// Bytes available in the buffer.
        available: usize,
    },

    /// The length prefix promises more bytes than the buffer holds.
    #[error(
        "string length is {declared}, but input only has {available} bytes \
         (including the 4 bytes length prefix)"
    )]
    TruncatedString {
        /// Length declared by the prefix.
        declared: usize,
        /// Bytes available in the buffer, prefix included.
        available: usize,
    },

    /// Not enough bytes for a window-size quad.
    #[error("number of bytes is less than 16: {available}")]
    TruncatedWindowSize {
        /// Bytes available in the buffer.
        available: usize,
    },

    /// A string field is not valid UTF-8.
    #[error("string is not valid utf-8")]
    InvalidUtf8,
}

/// Result type alias for codec operations.
pub type Result<T> = std::result::Result<T, WireError>;

impl From<std::str::Utf8Error> for WireError {
    fn from(_: std::str::Utf8Error) -> Self {
        WireError::InvalidUtf8
    }
}
