//! Errors surfaced by connections.

use std::io;

use thiserror::Error;

use crate::codec::CodecError;

/// Failure to enqueue an outbound message.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The send queue is full; retry later.
    #[error("send queue full")]
    WouldBlock,
    /// The connection is closed or closed before the packet was written.
    #[error("connection closed")]
    Closed,
    /// The message could not be encoded.
    #[error("encode error: {0}")]
    Codec(#[from] CodecError),
}

/// Failure that terminated a connection, reported to the `on_error` hook.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Decoding an inbound frame failed.
    #[error("codec error: {0}")]
    Codec(#[source] CodecError),
    /// Reading from or writing to the socket failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<CodecError> for ConnectionError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => Self::Io(e),
            other => Self::Codec(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::EofError;

    #[test]
    fn io_errors_from_the_codec_are_unwrapped() {
        let err = ConnectionError::from(CodecError::Io(io::Error::other("reset")));
        assert!(matches!(err, ConnectionError::Io(_)));
        let err = ConnectionError::from(CodecError::Eof(EofError::MidHeader {
            bytes_received: 1,
            header_size: 8,
        }));
        assert!(matches!(err, ConnectionError::Codec(CodecError::Eof(_))));
    }
}
