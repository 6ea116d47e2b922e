//! Error types for the codec layer.
//!
//! The taxonomy separates wire-level framing problems, payload
//! (de)serialisation failures, premature EOF and transport I/O. One variant,
//! [`CodecError::UnrecognizedFrame`], is not a failure at all: it reports a
//! well-formed frame whose type tag has no registered decoder. The codec has
//! already consumed the frame, so the connection keeps reading.

use std::io;

use thiserror::Error;

use crate::message::BoxError;

/// Framing-level errors occurring during frame boundary detection.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// Frame length prefix indicates a payload exceeding the configured maximum.
    #[error("frame exceeds max length: {size} > {max}")]
    OversizedFrame {
        /// Payload size indicated by the length prefix or the outbound message.
        size: usize,
        /// Maximum allowed payload size.
        max: usize,
    },
}

/// EOF conditions that cut a frame short.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum EofError {
    /// The peer closed the connection while the frame header was being read.
    #[error("premature EOF during header: {bytes_received} of {header_size} header bytes")]
    MidHeader {
        /// Header bytes received before EOF.
        bytes_received: usize,
        /// Expected header size.
        header_size: usize,
    },

    /// The peer closed the connection after the header but before the payload
    /// was complete.
    #[error("premature EOF: {bytes_received} bytes of {expected} byte payload received")]
    MidFrame {
        /// Payload bytes received before EOF.
        bytes_received: usize,
        /// Payload size announced by the header.
        expected: usize,
    },
}

/// Top-level codec error.
///
/// # Examples
///
/// ```
/// use wirelink::codec::{CodecError, FramingError};
///
/// let err = CodecError::Framing(FramingError::OversizedFrame {
///     size: 2000,
///     max: 1024,
/// });
/// assert!(err.should_disconnect());
///
/// let skip = CodecError::UnrecognizedFrame {
///     message_type: 99,
///     length: 4,
/// };
/// assert!(skip.is_unrecognized());
/// assert!(!skip.should_disconnect());
/// ```
#[derive(Debug, Error)]
pub enum CodecError {
    /// Framing layer error.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// A complete frame arrived whose type tag has no registered decoder.
    ///
    /// The frame has been consumed; the stream is positioned at the next one.
    #[error("unrecognized frame: type {message_type}, {length} payload bytes skipped")]
    UnrecognizedFrame {
        /// Type tag read from the frame header.
        message_type: u32,
        /// Number of payload bytes skipped.
        length: usize,
    },

    /// An outbound message failed to serialise.
    #[error("failed to serialize message type {message_type}")]
    Serialize {
        /// Type tag of the offending message.
        message_type: u32,
        /// Underlying serialiser error.
        #[source]
        source: BoxError,
    },

    /// A registered decoder rejected an inbound payload.
    #[error("failed to deserialize message type {message_type}")]
    Deserialize {
        /// Type tag read from the frame header.
        message_type: u32,
        /// Underlying decoder error.
        #[source]
        source: BoxError,
    },

    /// The stream ended part-way through a frame.
    #[error("EOF error: {0}")]
    Eof(#[from] EofError),

    /// Transport error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// Return `true` for the forward-compatible "unknown type tag" signal.
    #[must_use]
    pub fn is_unrecognized(&self) -> bool { matches!(self, Self::UnrecognizedFrame { .. }) }

    /// Return `true` if the error should terminate the connection.
    #[must_use]
    pub fn should_disconnect(&self) -> bool { !self.is_unrecognized() }
}
