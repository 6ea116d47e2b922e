//! Shared utilities for integration tests.

// Items in this shared module may not be used by all test binaries that import it.
#![allow(
    dead_code,
    reason = "shared test utilities are not used by all test binaries"
)]

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::{net::TcpStream, task::JoinHandle};
use wirelink::{
    connection::Connection,
    server::{Server, ServerBuilder, ServerError},
};
use wirelink_testing::bind_local;

/// Server started on a loopback listener.
pub struct Running {
    pub server: Server,
    pub addr: SocketAddr,
    pub accept: JoinHandle<Result<(), ServerError>>,
}

/// Build `builder` and start it on a free loopback port.
pub async fn serve(builder: ServerBuilder) -> Running {
    let server = builder.build();
    let (listener, addr) = bind_local().await;
    let running = server.clone();
    let accept = tokio::spawn(async move { running.start(listener).await });
    Running {
        server,
        addr,
        accept,
    }
}

/// Open a raw socket to `addr`.
pub async fn dial(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.expect("connect to server")
}

/// Connections observed by an `on_connect` hook.
#[derive(Clone, Default)]
pub struct Seen(Arc<Mutex<Vec<Connection>>>);

impl Seen {
    pub fn push(&self, conn: &Connection) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(conn.clone());
    }

    pub fn all(&self) -> Vec<Connection> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize { self.all().len() }
}
