//! End-to-end tests for the reconnecting [`Client`].

mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use common::{Seen, serve};
use rstest::rstest;
use tokio::{sync::mpsc, time::timeout};
use wirelink::{
    client::{Client, ClientError},
    connection::Connection,
    hooks::ConnectionHooks,
    router::Router,
    server::{BackoffConfig, Server},
};
use wirelink_testing::{Chat, Tick, echo_router, wait_until};

const LIMIT: Duration = Duration::from_secs(2);

const FAST_RECONNECT: BackoffConfig = BackoffConfig {
    initial_delay: Duration::from_millis(10),
    max_delay: Duration::from_millis(40),
};

/// Client hooks forwarding every unhandled [`Chat`] to a channel.
fn inbox() -> (ConnectionHooks, mpsc::UnboundedReceiver<Chat>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let hooks = ConnectionHooks::new().on_message(move |msg, _| {
        if let Some(chat) = msg.downcast::<Chat>() {
            let _ = tx.send(*chat);
        }
    });
    (hooks, rx)
}

fn client_router() -> Router { Router::new().register::<Chat>().expect("register chat") }

#[rstest]
#[tokio::test]
async fn client_receives_the_server_reply() {
    let running = serve(Server::builder().router(echo_router()).workers(1)).await;
    let (hooks, mut rx) = inbox();
    let client = Client::builder()
        .router(client_router())
        .hooks(hooks)
        .connect(running.addr)
        .await
        .expect("connect");

    client
        .write_and_wait(&Chat::new("ping"))
        .await
        .expect("flush");
    let reply = timeout(LIMIT, rx.recv())
        .await
        .expect("reply in time")
        .expect("inbox open");
    assert_eq!(reply, Chat::new("ping"));

    client.shutdown().await;
    running.server.stop().await;
}

#[rstest]
#[tokio::test]
async fn reconnects_after_the_server_drops_the_session() {
    let seen = Seen::default();
    let hook = seen.clone();
    let running = serve(
        Server::builder()
            .router(echo_router())
            .workers(1)
            .hooks(ConnectionHooks::new().on_connect(move |conn| {
                hook.push(conn);
                true
            })),
    )
    .await;
    let (hooks, mut rx) = inbox();
    let client = Client::builder()
        .router(client_router())
        .hooks(hooks)
        .reconnect(true)
        .reconnect_backoff(FAST_RECONNECT)
        .connect(running.addr)
        .await
        .expect("connect");
    let id = client.id();
    assert!(wait_until(LIMIT, || async { seen.len() == 1 }).await);

    seen.all().first().expect("server session").close();
    assert!(wait_until(LIMIT, || async { client.reconnects() == 1 }).await);
    assert_eq!(client.id(), id);
    assert_eq!(client.session().id(), id);
    assert!(!client.is_closed());

    client
        .write_and_wait(&Chat::new("again"))
        .await
        .expect("flush on new session");
    let reply = timeout(LIMIT, rx.recv())
        .await
        .expect("reply in time")
        .expect("inbox open");
    assert_eq!(reply.text, "again");

    client.shutdown().await;
    running.server.stop().await;
}

#[rstest]
#[tokio::test]
async fn retries_until_the_server_returns() {
    let running = serve(Server::builder().router(echo_router()).workers(1)).await;
    let addr = running.addr;
    let client = Client::builder()
        .router(client_router())
        .reconnect(true)
        .reconnect_backoff(FAST_RECONNECT)
        .connect(addr)
        .await
        .expect("connect");

    running.server.stop().await;
    assert!(wait_until(LIMIT, || async { client.is_closed() }).await);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(client.reconnects(), 0);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("rebind address");
    let server = Server::builder().router(echo_router()).workers(1).build();
    let serving = server.clone();
    tokio::spawn(async move { serving.start(listener).await });

    assert!(wait_until(LIMIT, || async { client.reconnects() == 1 }).await);
    client.shutdown().await;
    server.stop().await;
}

#[rstest]
#[tokio::test]
async fn shutdown_disables_reconnect() {
    let running = serve(Server::builder().router(echo_router()).workers(1)).await;
    let client = Client::builder()
        .router(client_router())
        .reconnect(true)
        .reconnect_backoff(FAST_RECONNECT)
        .connect(running.addr)
        .await
        .expect("connect");
    assert!(wait_until(LIMIT, || async { running.server.connection_count() == 1 }).await);

    timeout(LIMIT, client.shutdown())
        .await
        .expect("shutdown finishes");
    assert!(client.is_closed());
    assert!(!client.reconnect_enabled());
    assert!(wait_until(LIMIT, || async { running.server.connection_count() == 0 }).await);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(client.reconnects(), 0);
    assert_eq!(running.server.connection_count(), 0);
    running.server.stop().await;
}

#[rstest]
#[tokio::test]
async fn timers_run_on_the_client_session() {
    let running = serve(Server::builder().router(echo_router()).workers(1)).await;
    let client = Client::builder()
        .router(client_router())
        .connect(running.addr)
        .await
        .expect("connect");

    let once = Arc::new(AtomicUsize::new(0));
    let fired = Arc::clone(&once);
    client
        .run_after(Duration::from_millis(20), move |_, _| {
            let fired = Arc::clone(&fired);
            async move {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        })
        .expect("schedule one-shot");

    let ticks = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&ticks);
    let every = client
        .run_every(Duration::from_millis(15), move |_, conn: Connection| {
            let counted = Arc::clone(&counted);
            async move {
                let n = counted.fetch_add(1, Ordering::SeqCst);
                let _ = conn.write(&Tick(n as u64));
            }
        })
        .expect("schedule repeating");

    assert!(wait_until(LIMIT, || async { once.load(Ordering::SeqCst) == 1 }).await);
    assert!(wait_until(LIMIT, || async { ticks.load(Ordering::SeqCst) >= 3 }).await);
    assert!(client.cancel_timer(every));
    let after_cancel = ticks.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(ticks.load(Ordering::SeqCst) <= after_cancel + 1);
    assert_eq!(once.load(Ordering::SeqCst), 1);
    assert!(client.session().pending_timers().is_empty());

    client.shutdown().await;
    assert!(client.run_after(Duration::from_millis(1), |_, _| async {}).is_none());
    running.server.stop().await;
}

#[rstest]
#[tokio::test]
async fn on_connect_can_refuse_the_session() {
    let running = serve(Server::builder().router(echo_router()).workers(1)).await;
    let err = Client::builder()
        .hooks(ConnectionHooks::new().on_connect(|_| false))
        .connect(running.addr)
        .await
        .expect_err("rejected");
    assert!(matches!(err, ClientError::Rejected));
    running.server.stop().await;
}

#[rstest]
#[tokio::test]
async fn dialing_a_closed_port_fails() {
    let (listener, addr) = wirelink_testing::bind_local().await;
    drop(listener);
    let err = Client::builder()
        .connect(addr)
        .await
        .expect_err("nothing listening");
    assert!(matches!(err, ClientError::Connect(_)));
}
