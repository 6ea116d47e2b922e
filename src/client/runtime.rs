//! Session dialing and the reconnect supervisor.

use std::{
    io,
    net::SocketAddr,
    sync::{Arc, PoisonError, Weak, atomic::Ordering},
};

use log::{info, warn};
use tokio::{
    net::{TcpSocket, TcpStream},
    select,
    sync::Notify,
    time::sleep,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{ClientError, ClientInner, SocketOptions};
use crate::{
    connection::{Connection, ConnectionParts, Context, Transport},
    registry::ConnectionId,
    server::Backoff,
    timer::{TimingWheel, WheelConfig, route_expired},
};

/// Everything needed to open a session to one address.
pub(super) struct Dialer {
    pub(super) addr: SocketAddr,
    pub(super) id: ConnectionId,
    pub(super) context: Arc<Context>,
    pub(super) wheel: WheelConfig,
    pub(super) socket: SocketOptions,
    #[cfg(feature = "tls")]
    pub(super) tls: Option<(
        tokio_rustls::TlsConnector,
        tokio_rustls::rustls::pki_types::ServerName<'static>,
    )>,
    /// Root token; every session token derives from it.
    pub(super) token: CancellationToken,
    pub(super) tracker: TaskTracker,
    /// Notified once by each session after its teardown completes.
    pub(super) closed: Arc<Notify>,
}

impl Dialer {
    /// Connect and assemble an unstarted session.
    pub(super) async fn dial(&self) -> Result<Connection, ClientError> {
        let socket = if self.addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(ClientError::Connect)?;
        self.socket.apply(&socket).map_err(ClientError::Connect)?;
        let stream = socket
            .connect(self.addr)
            .await
            .map_err(ClientError::Connect)?;
        let local_addr = stream.local_addr().map_err(ClientError::Connect)?;
        let transport = self.wrap(stream).await?;

        let token = self.token.child_token();
        let (wheel, expired) = TimingWheel::start(self.wheel, token.child_token(), &self.tracker);
        let closed = Arc::clone(&self.closed);
        let session = Connection::new(ConnectionParts {
            id: self.id,
            transport,
            local_addr,
            peer_addr: self.addr,
            context: Arc::clone(&self.context),
            wheel,
            owns_wheel: true,
            token: token.clone(),
            spawner: self.tracker.clone(),
            on_closed: Some(Box::new(move |_| closed.notify_one())),
        });
        let target = session.clone();
        self.tracker.spawn(route_expired(expired, token, move |id| {
            (id == target.id()).then(|| target.clone())
        }));
        Ok(session)
    }

    #[cfg_attr(
        not(feature = "tls"),
        expect(clippy::unused_async, reason = "only the TLS handshake awaits")
    )]
    async fn wrap(&self, stream: TcpStream) -> Result<Box<dyn Transport>, ClientError> {
        #[cfg(feature = "tls")]
        if let Some((connector, server_name)) = &self.tls {
            let stream = connector
                .connect(server_name.clone(), stream)
                .await
                .map_err(ClientError::Tls)?;
            return Ok(Box::new(stream));
        }
        Ok(Box::new(stream))
    }
}

impl ClientInner {
    /// Swap in a freshly dialed session and start it.
    fn install(&self, session: Connection) {
        if !self.dialer.context.hooks.run_on_connect(&session) {
            self.reconnect.store(false, Ordering::Release);
            info!(
                "reconnected session rejected by on_connect: id={}, addr={}",
                self.dialer.id, self.dialer.addr
            );
            session.close();
            return;
        }
        {
            let mut current = self.session.write().unwrap_or_else(PoisonError::into_inner);
            if !self.reconnect.load(Ordering::Acquire) {
                drop(current);
                session.close();
                return;
            }
            *current = session.clone();
        }
        let reconnects = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        session.start();
        info!(
            "client reconnected: id={}, addr={}, reconnects={reconnects}",
            self.dialer.id, self.dialer.addr
        );
    }
}

/// Replace closed sessions while reconnect stays enabled.
#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
pub(super) async fn supervise(
    client: Weak<ClientInner>,
    closed: Arc<Notify>,
    token: CancellationToken,
) {
    loop {
        select! {
            biased;

            () = token.cancelled() => return,
            () = closed.notified() => {}
        }
        let backoff = match client.upgrade() {
            Some(inner) if inner.reconnect.load(Ordering::Acquire) => inner.backoff.start(),
            _ => return,
        };
        redial(&client, &token, backoff).await;
    }
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
async fn redial(client: &Weak<ClientInner>, token: &CancellationToken, mut backoff: Backoff) {
    loop {
        select! {
            biased;

            () = token.cancelled() => return,
            () = sleep(backoff.next_delay()) => {}
        }
        let Some(inner) = client.upgrade() else {
            return;
        };
        if !inner.reconnect.load(Ordering::Acquire) {
            return;
        }
        let dialed = select! {
            biased;

            () = token.cancelled() => return,
            dialed = inner.dialer.dial() => dialed,
        };
        match dialed {
            Ok(session) => {
                inner.install(session);
                return;
            }
            Err(e) => {
                warn!(
                    "reconnect failed: id={}, addr={}, error={e}, retry_in={:?}",
                    inner.dialer.id,
                    inner.dialer.addr,
                    backoff.upcoming()
                );
            }
        }
    }
}

/// Resolve `addr` to the first socket address it names.
pub(super) async fn resolve(addr: impl tokio::net::ToSocketAddrs) -> Result<SocketAddr, ClientError> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(ClientError::Connect)?
        .next()
        .ok_or_else(|| {
            ClientError::Connect(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "address resolved to nothing",
            ))
        })
}
