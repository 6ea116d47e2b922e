//! Reconnecting client.
//!
//! A [`Client`] is a stable handle over a sequence of client sessions. Each
//! session is a [`Connection`] with its own timing wheel whose handlers run
//! inline on the session's dispatch loop. When reconnect is enabled and a
//! session closes, the client re-dials the same address with capped
//! exponential back-off and swaps in a fresh session carrying the same
//! [`ConnectionId`]. Timers and data attached to a session end with it.

use std::{
    fmt,
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        PoisonError,
        RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::time::Instant;

use crate::{
    connection::{Connection, WriteError},
    message::Message,
    registry::ConnectionId,
    server::BackoffConfig,
    timer::TimerId,
};

mod builder;
mod config;
mod error;
mod runtime;

pub use builder::{ClientBuilder, DEFAULT_RECONNECT_BACKOFF};
pub use config::SocketOptions;
pub use error::ClientError;
use runtime::Dialer;

struct ClientInner {
    dialer: Dialer,
    backoff: BackoffConfig,
    reconnect: AtomicBool,
    generation: AtomicU64,
    session: RwLock<Connection>,
}

impl Drop for ClientInner {
    fn drop(&mut self) { self.dialer.token.cancel(); }
}

/// Handle to a client session that survives reconnects.
///
/// Every call acts on the current session. Clones share the same client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Start configuring a client.
    #[must_use]
    pub fn builder() -> ClientBuilder { ClientBuilder::new() }

    /// The current session.
    #[must_use]
    pub fn session(&self) -> Connection {
        self.inner
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Identifier shared by every session of this client.
    #[must_use]
    pub fn id(&self) -> ConnectionId { self.inner.dialer.id }

    /// Address the client dials.
    #[must_use]
    pub fn server_addr(&self) -> SocketAddr { self.inner.dialer.addr }

    /// Number of sessions installed after the first one.
    #[must_use]
    pub fn reconnects(&self) -> u64 { self.inner.generation.load(Ordering::Acquire) }

    /// Return `true` if a closed session will be replaced.
    #[must_use]
    pub fn reconnect_enabled(&self) -> bool { self.inner.reconnect.load(Ordering::Acquire) }

    /// Return `true` if the current session is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.session().is_closed() }

    /// Encode `message` and enqueue it on the current session.
    ///
    /// # Errors
    ///
    /// See [`Connection::write`].
    pub fn write(&self, message: &dyn Message) -> Result<(), WriteError> {
        self.session().write(message)
    }

    /// Encode `message` on the current session and wait for the flush.
    ///
    /// # Errors
    ///
    /// See [`Connection::write_and_wait`].
    pub async fn write_and_wait(&self, message: &dyn Message) -> Result<(), WriteError> {
        self.session().write_and_wait(message).await
    }

    /// See [`Connection::run_at`].
    pub fn run_at<F, Fut>(&self, deadline: Instant, callback: F) -> Option<TimerId>
    where
        F: Fn(Instant, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.session().run_at(deadline, callback)
    }

    /// See [`Connection::run_after`].
    pub fn run_after<F, Fut>(&self, delay: Duration, callback: F) -> Option<TimerId>
    where
        F: Fn(Instant, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.session().run_after(delay, callback)
    }

    /// See [`Connection::run_every`].
    pub fn run_every<F, Fut>(&self, interval: Duration, callback: F) -> Option<TimerId>
    where
        F: Fn(Instant, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.session().run_every(interval, callback)
    }

    /// Attach `value` to the current session.
    ///
    /// A reconnected session starts without data; see
    /// [`Connection::insert_data`].
    pub fn insert_data<T>(&self, value: T) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.session().insert_data(value)
    }

    /// Value of type `T` attached to the current session.
    #[must_use]
    pub fn data<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.session().data()
    }

    /// Cancel a timer on the current session.
    pub fn cancel_timer(&self, id: TimerId) -> bool { self.session().cancel_timer(id) }

    /// Close the current session.
    ///
    /// With reconnect enabled a new session replaces it.
    pub fn close(&self) { self.session().close(); }

    /// Disable reconnect, close the current session and wait for every
    /// client task to finish.
    pub async fn shutdown(&self) {
        self.inner.reconnect.store(false, Ordering::Release);
        let session = self.session();
        session.close();
        session.wait_closed().await;
        self.inner.dialer.token.cancel();
        self.inner.dialer.tracker.close();
        self.inner.dialer.tracker.wait().await;
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id())
            .field("server_addr", &self.server_addr())
            .field("reconnects", &self.reconnects())
            .finish_non_exhaustive()
    }
}
