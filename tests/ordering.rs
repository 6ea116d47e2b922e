//! Handler execution order under the worker pool.

mod common;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use common::{dial, serve};
use rstest::rstest;
use tokio::io::AsyncWriteExt;
use wirelink::{connection::Connection, registry::ConnectionId, router::Router, server::Server};
use wirelink_testing::{Tick, encode_frame, wait_until};

type Log = Arc<Mutex<HashMap<ConnectionId, Vec<u64>>>>;

fn recording_router(log: &Log) -> Router {
    let log = Arc::clone(log);
    Router::new()
        .route(move |tick: Tick, conn: Connection| {
            let log = Arc::clone(&log);
            async move {
                // Uneven handler latency must not reorder a connection's messages.
                if tick.0 % 3 == 0 {
                    tokio::task::yield_now().await;
                }
                log.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entry(conn.id())
                    .or_default()
                    .push(tick.0);
            }
        })
        .expect("route tick")
}

fn total(log: &Log) -> usize {
    log.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .values()
        .map(Vec::len)
        .sum()
}

#[rstest]
#[case(1)]
#[case(4)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn per_connection_order_is_preserved(#[case] workers: usize) {
    const PER_CONNECTION: u64 = 200;
    let log = Log::default();
    let running = serve(
        Server::builder()
            .router(recording_router(&log))
            .workers(workers),
    )
    .await;

    let mut senders = Vec::new();
    for _ in 0..3 {
        let mut stream = dial(running.addr).await;
        senders.push(tokio::spawn(async move {
            let mut wire = Vec::new();
            for n in 0..PER_CONNECTION {
                wire.extend(encode_frame(&Tick(n)));
            }
            stream.write_all(&wire).await.expect("write ticks");
            stream
        }));
    }
    let mut streams = Vec::new();
    for sender in senders {
        streams.push(sender.await.expect("join"));
    }

    let expected = 3 * usize::try_from(PER_CONNECTION).expect("fits");
    assert!(wait_until(Duration::from_secs(5), || async { total(&log) == expected }).await);

    let log = log.lock().unwrap_or_else(PoisonError::into_inner).clone();
    assert_eq!(log.len(), 3);
    let in_order: Vec<u64> = (0..PER_CONNECTION).collect();
    for seen in log.values() {
        assert_eq!(seen, &in_order);
    }
    drop(streams);
    running.server.stop().await;
}
