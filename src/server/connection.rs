//! Admission of accepted sockets.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use log::{debug, info, warn};
use socket2::SockRef;
use tokio::{net::TcpStream, time::Instant};

use super::ServerShared;
use crate::{
    connection::{Connection, ConnectionParts, Transport},
    registry::Reservation,
    timer::deadline_after,
};

/// Admit or refuse a freshly accepted socket.
///
/// The capacity check happens synchronously so that concurrent accept loops
/// never push the registry past its maximum; the rest of the setup runs on
/// the server tracker.
pub(super) fn admit(shared: &Arc<ServerShared>, stream: TcpStream, peer_addr: SocketAddr) {
    if shared.zero_linger {
        if let Err(e) = SockRef::from(&stream).set_linger(Some(Duration::ZERO)) {
            debug!("failed to set zero linger: peer_addr={peer_addr}, error={e}");
        }
    }
    let Some(reservation) = shared.registry.try_reserve(shared.max_connections) else {
        crate::metrics::inc_connections_refused();
        info!(
            "connection refused: peer_addr={peer_addr}, max_connections={}",
            shared.max_connections
        );
        return;
    };
    let task = establish(Arc::clone(shared), stream, peer_addr, reservation);
    shared.tracker.spawn(task);
}

async fn establish(
    shared: Arc<ServerShared>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    reservation: Reservation,
) {
    let local_addr = match stream.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!("failed to read local address: peer_addr={peer_addr}, error={e}");
            return;
        }
    };
    let id = shared.ids.next();
    let transport = match wrap(&shared, stream).await {
        Ok(transport) => transport,
        Err(e) => {
            warn!("TLS handshake failed: id={id}, peer_addr={peer_addr}, error={e}");
            return;
        }
    };
    let conn = Connection::new(ConnectionParts {
        id,
        transport,
        local_addr,
        peer_addr,
        context: Arc::clone(&shared.context),
        wheel: shared.wheel.clone(),
        owns_wheel: false,
        token: shared.token.child_token(),
        spawner: shared.tracker.clone(),
        on_closed: None,
    });
    reservation.commit(conn.clone());

    let scheduled = shared.scheduled().clone();
    if let Some(scheduled) = scheduled {
        conn.add_timer(
            deadline_after(Instant::now(), scheduled.interval),
            scheduled.interval,
            scheduled.callback,
        );
    }
    if !conn.context().hooks.run_on_connect(&conn) {
        info!("connection rejected by on_connect: id={id}, peer_addr={peer_addr}");
        conn.close();
        return;
    }
    conn.start();
}

#[cfg_attr(
    not(feature = "tls"),
    expect(clippy::unused_async, reason = "only the TLS handshake awaits")
)]
async fn wrap(shared: &ServerShared, stream: TcpStream) -> io::Result<Box<dyn Transport>> {
    #[cfg(feature = "tls")]
    if let Some(acceptor) = &shared.tls {
        return Ok(Box::new(acceptor.accept(stream).await?));
    }
    #[cfg(not(feature = "tls"))]
    let _ = shared;
    Ok(Box::new(stream))
}
