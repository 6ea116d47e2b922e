//! Chat echo server with a periodic heartbeat.
//!
//! Run with `cargo run --example echo -- 127.0.0.1:7000`, then connect with a
//! [`Client`](wirelink::Client) or any program speaking the default framing:
//! a 4-byte big-endian type tag, a 4-byte big-endian payload length and a
//! bincode payload. Type 7 carries a `String` and is echoed back; every
//! connection receives a type 8 heartbeat each five seconds.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use bincode::{Decode, Encode};
use tokio::net::TcpListener;
use wirelink::{
    connection::Connection,
    hooks::ConnectionHooks,
    message::WireMessage,
    router::Router,
    server::Server,
};

#[derive(Debug, Encode, Decode)]
struct Chat(String);

impl WireMessage for Chat {
    const MESSAGE_TYPE: u32 = 7;
}

#[derive(Debug, Encode, Decode)]
struct Heartbeat(u64);

impl WireMessage for Heartbeat {
    const MESSAGE_TYPE: u32 = 8;
}

static BEATS: AtomicU64 = AtomicU64::new(0);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt::init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7000".to_owned());

    let router = Router::new().route(|msg: Chat, conn: Connection| async move {
        tracing::info!(id = %conn.id(), text = %msg.0, "echo");
        if let Err(e) = conn.write(&msg) {
            tracing::warn!(id = %conn.id(), error = %e, "echo failed");
        }
    })?;

    let hooks = ConnectionHooks::new()
        .on_connect(|conn| {
            tracing::info!(id = %conn.id(), peer = %conn.peer_addr(), "client connected");
            true
        })
        .on_close(|conn| tracing::info!(id = %conn.id(), "client disconnected"));

    let server = Server::builder()
        .router(router)
        .hooks(hooks)
        .schedule(Duration::from_secs(5), |_, conn: Connection| async move {
            let beat = Heartbeat(BEATS.fetch_add(1, Ordering::Relaxed));
            if let Err(e) = conn.write(&beat) {
                tracing::debug!(id = %conn.id(), error = %e, "heartbeat dropped");
            }
        })
        .build();

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");

    let running = server.clone();
    tokio::select! {
        result = running.start(listener) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }
    server.stop().await;
    Ok(())
}
