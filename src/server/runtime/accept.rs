//! Accept-loop utilities for the server runtime.

use std::{io, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use log::{error, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    time::sleep,
};
use tokio_util::sync::CancellationToken;

use super::backoff::{Backoff, BackoffConfig};

/// Abstraction for sources of incoming connections consumed by the accept loop.
///
/// Implementations must be cancellation-safe: dropping a pending `accept()`
/// future must not leak resources.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub(in crate::server) trait AcceptListener: Send + Sync {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl AcceptListener for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> { TcpListener::local_addr(self) }
}

/// Outcome of a single accept attempt.
enum Step {
    Continue,
    Stop,
    Fatal(io::Error),
}

/// Return `true` for accept failures worth retrying.
///
/// Covers aborted handshakes, interrupted calls and resource exhaustion
/// (`EMFILE`, `ENFILE`, `ENOBUFS`, `ENOMEM`). Uncategorised errors such as
/// `ErrorKind::Other` are fatal.
pub(in crate::server) fn is_temporary(err: &io::Error) -> bool {
    use io::ErrorKind;

    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
            | ErrorKind::OutOfMemory
    ) || is_resource_exhaustion(err)
}

#[cfg(unix)]
fn is_resource_exhaustion(err: &io::Error) -> bool {
    // ENOMEM, ENFILE, EMFILE; ENOBUFS is 105 on Linux and 55 on the BSDs.
    const CODES: &[i32] = if cfg!(target_os = "linux") {
        &[12, 23, 24, 105]
    } else {
        &[12, 23, 24, 55]
    };
    err.raw_os_error().is_some_and(|code| CODES.contains(&code))
}

#[cfg(not(unix))]
fn is_resource_exhaustion(_err: &io::Error) -> bool { false }

/// Accept connections from `listener` until `shutdown` fires.
///
/// Each accepted stream is passed to `on_accept`, which must not block.
/// Temporary failures back off exponentially between `backoff.initial_delay`
/// and `backoff.max_delay`, still observing `shutdown` while waiting; any
/// other failure ends the loop.
///
/// # Errors
///
/// Returns the first non-temporary accept error.
pub(in crate::server) async fn accept_loop<L, H>(
    listener: Arc<L>,
    shutdown: CancellationToken,
    backoff: BackoffConfig,
    on_accept: H,
) -> io::Result<()>
where
    L: AcceptListener + 'static,
    H: Fn(TcpStream, SocketAddr) + Send + Sync,
{
    let mut backoff = backoff.start();
    loop {
        match accept_iteration(&listener, &shutdown, &mut backoff, &on_accept).await {
            Step::Continue => {}
            Step::Stop => return Ok(()),
            Step::Fatal(e) => return Err(e),
        }
    }
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
async fn accept_iteration<L, H>(
    listener: &Arc<L>,
    shutdown: &CancellationToken,
    backoff: &mut Backoff,
    on_accept: &H,
) -> Step
where
    L: AcceptListener + 'static,
    H: Fn(TcpStream, SocketAddr) + Send + Sync,
{
    select! {
        biased;

        () = shutdown.cancelled() => Step::Stop,
        res = listener.accept() => match res {
            Ok((stream, peer_addr)) => {
                on_accept(stream, peer_addr);
                backoff.reset();
                Step::Continue
            }
            Err(e) if is_temporary(&e) => {
                let delay = backoff.next_delay();
                let local_addr = listener.local_addr().ok();
                warn!("accept error: error={e:?}, local_addr={local_addr:?}, retry_in={delay:?}");
                select! {
                    biased;

                    () = shutdown.cancelled() => Step::Stop,
                    () = sleep(delay) => Step::Continue,
                }
            }
            Err(e) => {
                let local_addr = listener.local_addr().ok();
                error!("fatal accept error: error={e:?}, local_addr={local_addr:?}");
                Step::Fatal(e)
            }
        },
    }
}
