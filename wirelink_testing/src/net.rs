use std::{
    future::Future,
    net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener},
    time::Duration,
};

use rstest::fixture;
use tokio::{net::TcpListener, time::Instant};

#[fixture]
/// A bound listener on a free loopback port.
///
/// Keeping the listener bound prevents another process from claiming the
/// port between discovery and use.
pub fn free_listener() -> StdTcpListener {
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0);
    let listener = StdTcpListener::bind(addr).expect("Failed to bind free port listener");
    listener
        .set_nonblocking(true)
        .expect("Failed to make listener non-blocking");
    listener
}

/// Bind a Tokio listener on a free loopback port and return its address.
pub async fn bind_local() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind loopback listener");
    let addr = listener.local_addr().expect("listener address");
    (listener, addr)
}

/// Poll `condition` every few milliseconds until it holds or `limit`
/// elapses. Returns whether it held.
pub async fn wait_until<F, Fut>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + limit;
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
