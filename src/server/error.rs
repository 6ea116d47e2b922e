//! Errors raised by [`Server`](super::Server) operations.

use std::io;

use thiserror::Error;

use crate::{codec::CodecError, connection::WriteError, registry::ConnectionId};

/// Errors that may occur while running or administering the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listener failed with a non-temporary error.
    #[error("accept error: {0}")]
    Accept(#[from] io::Error),
    /// The server has been stopped.
    #[error("server is stopped")]
    Closed,
    /// No live connection has the given identifier.
    #[error("{0} not found")]
    NotFound(ConnectionId),
    /// Enqueueing a message on a connection failed.
    #[error("write to {id} failed: {source}")]
    Write {
        /// Target connection.
        id: ConnectionId,
        /// Underlying write failure.
        #[source]
        source: WriteError,
    },
    /// A message could not be encoded.
    #[error("encode error: {0}")]
    Codec(#[from] CodecError),
}
