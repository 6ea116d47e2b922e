//! Tokio-based server hosting many [`Connection`]s.
//!
//! A [`Server`] owns the shared collaborators of its connections: the
//! registry used for admission control and broadcast, the worker pool that
//! runs handlers, one timing wheel and the task that routes its expirations.
//! Build one with [`Server::builder`], then call [`Server::start`] with each
//! listener it should serve.

use std::{
    fmt,
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use log::warn;
use tokio::time::Instant;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    connection::{Connection, Context, erase_callback},
    message::Message,
    registry::{ConnectionId, ConnectionRegistry, IdGenerator},
    timer::{TimerCallback, TimingWheel},
    worker::WorkerPool,
};

mod config;
mod connection;
mod error;
mod runtime;
#[cfg(test)]
mod test_util;

pub use config::{DEFAULT_MAX_CONNECTIONS, ServerBuilder};
pub use error::ServerError;
pub(crate) use runtime::Backoff;
pub use runtime::BackoffConfig;

/// Periodic callback attached to every accepted connection.
#[derive(Clone)]
struct Scheduled {
    interval: Duration,
    callback: TimerCallback,
}

pub(crate) struct ServerShared {
    context: Arc<Context>,
    registry: Arc<ConnectionRegistry>,
    pool: Arc<WorkerPool>,
    owns_pool: bool,
    ids: Arc<IdGenerator>,
    wheel: TimingWheel,
    token: CancellationToken,
    accept_token: CancellationToken,
    tracker: TaskTracker,
    max_connections: usize,
    backoff: BackoffConfig,
    zero_linger: bool,
    #[cfg(feature = "tls")]
    tls: Option<tokio_rustls::TlsAcceptor>,
    scheduled: Mutex<Option<Scheduled>>,
    stopped: AtomicBool,
    local_addrs: Mutex<Vec<SocketAddr>>,
}

impl ServerShared {
    fn scheduled(&self) -> MutexGuard<'_, Option<Scheduled>> {
        self.scheduled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn local_addrs(&self) -> MutexGuard<'_, Vec<SocketAddr>> {
        self.local_addrs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a running server.
///
/// Clones share the same server.
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    /// Start configuring a server.
    #[must_use]
    pub fn builder() -> ServerBuilder { ServerBuilder::new() }

    pub(crate) fn from_shared(shared: Arc<ServerShared>) -> Self { Self { shared } }

    /// Encode `message` once and enqueue it on every live connection.
    ///
    /// Per-connection failures such as a full send queue are logged and
    /// skipped. Returns the number of connections the frame was queued on.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Codec`] if `message` cannot be encoded.
    pub fn broadcast(&self, message: &dyn Message) -> Result<usize, ServerError> {
        let bytes = self.shared.context.codec.encode(message)?;
        let mut queued = 0;
        for conn in self.shared.registry.snapshot() {
            match conn.write_frame(bytes.clone()) {
                Ok(()) => queued += 1,
                Err(e) => warn!("broadcast failed: id={}, error={e}", conn.id()),
            }
        }
        Ok(queued)
    }

    /// Enqueue `message` on the connection registered under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotFound`] if no such connection is live and
    /// [`ServerError::Write`] if the write is refused.
    pub fn unicast(&self, id: ConnectionId, message: &dyn Message) -> Result<(), ServerError> {
        let conn = self.connection(id).ok_or(ServerError::NotFound(id))?;
        conn.write(message)
            .map_err(|source| ServerError::Write { id, source })
    }

    /// Look up a live connection.
    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<Connection> {
        self.shared.registry.get(&id)
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize { self.shared.registry.len() }

    /// Run `callback` every `interval` on each connection accepted from now
    /// on, replacing any previously scheduled callback.
    pub fn schedule<F, Fut>(&self, interval: Duration, callback: F)
    where
        F: Fn(Instant, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.shared.scheduled() = Some(Scheduled {
            interval,
            callback: erase_callback(callback),
        });
    }

    /// Addresses of the listeners passed to [`Server::start`].
    #[must_use]
    pub fn local_addrs(&self) -> Vec<SocketAddr> { self.shared.local_addrs().clone() }

    /// Return `true` once [`Server::stop`] has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool { self.shared.stopped.load(Ordering::Acquire) }

    /// Root token of the server; every connection token derives from it.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken { self.shared.token.clone() }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("connections", &self.connection_count())
            .field("max_connections", &self.shared.max_connections)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}
