//! Error types for client operations.

use std::io;

/// Errors emitted while establishing a [`Client`](super::Client) session.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Resolving or dialing the server failed.
    #[error("failed to connect: {0}")]
    Connect(#[source] io::Error),
    /// The TLS handshake failed.
    #[error("TLS handshake failed: {0}")]
    Tls(#[source] io::Error),
    /// The `on_connect` hook refused the session.
    #[error("session rejected by on_connect")]
    Rejected,
}
