//! Runtime control for [`Server`]: serving listeners and stopping.

use std::sync::{Arc, atomic::Ordering};

use log::info;
use tokio::net::TcpListener;

mod accept;
mod backoff;

pub(crate) use backoff::Backoff;
pub use backoff::BackoffConfig;

use self::accept::{AcceptListener, accept_loop};
use super::{Server, ServerError, connection::admit};

impl Server {
    /// Accept connections from `listener` until [`Server::stop`] is called.
    ///
    /// May be called concurrently with several listeners; all share the
    /// server's admission limit.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Closed`] if the server was stopped and
    /// [`ServerError::Accept`] if the listener fails with a non-temporary
    /// error.
    pub async fn start(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.serve(Arc::new(listener)).await
    }

    pub(super) async fn serve<L>(&self, listener: Arc<L>) -> Result<(), ServerError>
    where
        L: AcceptListener + 'static,
    {
        if self.is_stopped() {
            return Err(ServerError::Closed);
        }
        if let Ok(addr) = listener.local_addr() {
            self.shared.local_addrs().push(addr);
            info!("server listening: addr={addr}");
        }
        let shared = Arc::clone(&self.shared);
        accept_loop(
            listener,
            self.shared.accept_token.clone(),
            self.shared.backoff,
            move |stream, peer_addr| admit(&shared, stream, peer_addr),
        )
        .await?;
        Ok(())
    }

    /// Stop accepting, close every connection and wait for all server tasks
    /// to finish.
    ///
    /// Idempotent. Pending writes get a bounded chance to flush.
    pub async fn stop(&self) {
        let shared = &self.shared;
        if !shared.stopped.swap(true, Ordering::AcqRel) {
            shared.accept_token.cancel();
            let connections = shared.registry.drain();
            info!("server stopping: connections={}", connections.len());
            for conn in &connections {
                conn.close();
            }
            shared.token.cancel();
            shared.tracker.close();
        }
        shared.tracker.wait().await;
        if shared.owns_pool {
            shared.pool.shutdown().await;
        }
    }
}
