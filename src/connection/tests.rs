//! Tests for the connection engine over in-memory duplex streams.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use bincode::{Decode, Encode};
use rstest::rstest;
use serial_test::serial;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::{Notify, mpsc as tokio_mpsc},
    time::timeout,
};
use tracing_test::traced_test;
use wirelink_testing::{LoggerHandle, logger, wait_until};

use super::*;
use crate::{
    codec::TypeLengthValueCodec,
    message::WireMessage,
    timer::{WheelConfig, route_expired},
};

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
struct Echo(String);

impl WireMessage for Echo {
    const MESSAGE_TYPE: u32 = 7;
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
struct Note(u32);

impl WireMessage for Note {
    const MESSAGE_TYPE: u32 = 9;
}

struct Harness {
    conn: Connection,
    peer: DuplexStream,
    codec: TypeLengthValueCodec,
    tracker: TaskTracker,
}

fn addr() -> SocketAddr { SocketAddr::from(([127, 0, 0, 1], 4000)) }

fn harness(router: Router, hooks: ConnectionHooks, config: ConnectionConfig) -> Harness {
    let (local, peer) = tokio::io::duplex(64 * 1024);
    let tracker = TaskTracker::new();
    let root = CancellationToken::new();
    let (wheel, timer_rx) = TimingWheel::start(
        WheelConfig {
            tick: Duration::from_millis(5),
            ..WheelConfig::default()
        },
        root.child_token(),
        &tracker,
    );
    let router = Arc::new(router);
    let codec = TypeLengthValueCodec::new(Arc::clone(&router));
    let context = Arc::new(Context {
        codec: Arc::new(codec.clone()),
        router,
        hooks,
        config,
        role: Role::Client,
    });
    let conn = Connection::new(ConnectionParts {
        id: ConnectionId::new(1),
        transport: Box::new(local),
        local_addr: addr(),
        peer_addr: addr(),
        context,
        wheel,
        owns_wheel: true,
        token: root.child_token(),
        spawner: tracker.clone(),
        on_closed: None,
    });
    let target = conn.clone();
    tracker.spawn(route_expired(timer_rx, root, move |id| {
        (id == target.id()).then(|| target.clone())
    }));
    Harness {
        conn,
        peer,
        codec,
        tracker,
    }
}

fn echo_router() -> Router {
    Router::new()
        .route(|msg: Echo, conn: Connection| async move {
            let _ = conn.write(&msg);
        })
        .expect("route echo")
        .register::<Note>()
        .expect("register note")
}

async fn read_frame(peer: &mut DuplexStream) -> (u32, Vec<u8>) {
    let message_type = peer.read_u32().await.expect("type");
    let len = peer.read_u32().await.expect("length");
    let mut payload = vec![0; len as usize];
    peer.read_exact(&mut payload).await.expect("payload");
    (message_type, payload)
}

async fn send(peer: &mut DuplexStream, codec: &TypeLengthValueCodec, msg: &dyn Message) {
    let frame = codec.encode(msg).expect("encode");
    peer.write_all(&frame).await.expect("write");
}

#[rstest]
#[tokio::test]
async fn full_send_queue_reports_would_block() {
    let h = harness(
        echo_router(),
        ConnectionHooks::new(),
        ConnectionConfig {
            send_queue: 2,
            ..ConnectionConfig::default()
        },
    );
    let msg = Echo("x".into());
    h.conn.write(&msg).expect("first");
    h.conn.write(&msg).expect("second");
    assert!(matches!(h.conn.write(&msg), Err(WriteError::WouldBlock)));
    assert!(matches!(
        h.conn.write_and_wait(&msg).await,
        Err(WriteError::WouldBlock)
    ));
    h.conn.close();
    h.conn.wait_closed().await;
}

#[rstest]
#[tokio::test]
async fn concurrent_closes_run_teardown_once() {
    let closes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closes);
    let h = harness(
        echo_router(),
        ConnectionHooks::new().on_close(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
        ConnectionConfig::default(),
    );
    h.conn.start();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let conn = h.conn.clone();
        handles.push(tokio::spawn(async move { conn.close() }));
    }
    for handle in handles {
        handle.await.expect("close task");
    }
    h.conn.wait_closed().await;
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert!(h.conn.is_closed());
    assert!(matches!(
        h.conn.write(&Echo("late".into())),
        Err(WriteError::Closed)
    ));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn handler_replies_through_the_write_loop() {
    let mut h = harness(
        echo_router(),
        ConnectionHooks::new(),
        ConnectionConfig::default(),
    );
    h.conn.start();
    let before = h.conn.heartbeat();
    tokio::time::advance(Duration::from_millis(10)).await;

    send(&mut h.peer, &h.codec, &Echo("hello".into())).await;
    let (message_type, payload) = read_frame(&mut h.peer).await;
    assert_eq!(message_type, 7);
    assert_eq!(Echo::from_payload(&payload).expect("decode"), Echo("hello".into()));
    assert!(h.conn.heartbeat() >= before + Duration::from_millis(10));

    h.conn.close();
    h.conn.wait_closed().await;
}

#[rstest]
#[tokio::test]
async fn messages_without_handler_reach_the_fallback() {
    let (tx, mut rx) = tokio_mpsc::unbounded_channel();
    let mut h = harness(
        echo_router(),
        ConnectionHooks::new().on_message(move |msg, _| {
            let _ = tx.send(msg.message_type());
        }),
        ConnectionConfig::default(),
    );
    h.conn.start();
    send(&mut h.peer, &h.codec, &Note(3)).await;
    let seen = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("fallback ran");
    assert_eq!(seen, Some(9));
    h.conn.close();
    h.conn.wait_closed().await;
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn unrecognized_frames_are_skipped() {
    let mut h = harness(
        echo_router(),
        ConnectionHooks::new(),
        ConnectionConfig::default(),
    );
    h.conn.start();
    let before = h.conn.heartbeat();
    tokio::time::advance(Duration::from_millis(10)).await;

    h.peer.write_u32(1234).await.expect("type");
    h.peer.write_u32(3).await.expect("length");
    h.peer.write_all(b"???").await.expect("payload");
    let refreshed = wait_until(Duration::from_secs(1), || async {
        h.conn.heartbeat() >= before + Duration::from_millis(10)
    })
    .await;
    assert!(refreshed, "unrecognized frame did not refresh the heartbeat");

    send(&mut h.peer, &h.codec, &Echo("after".into())).await;
    let (message_type, payload) = read_frame(&mut h.peer).await;
    assert_eq!(message_type, 7);
    assert_eq!(Echo::from_payload(&payload).expect("decode"), Echo("after".into()));
    assert!(!h.conn.is_closed());
    h.conn.close();
    h.conn.wait_closed().await;
}

#[rstest]
#[tokio::test]
async fn framing_errors_close_and_report() {
    let errors = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&errors);
    let mut h = harness(
        echo_router(),
        ConnectionHooks::new().on_error(move |_, err| {
            assert!(matches!(err, ConnectionError::Codec(_)));
            counter.fetch_add(1, Ordering::SeqCst);
        }),
        ConnectionConfig::default(),
    );
    h.conn.start();
    h.peer.write_u32(7).await.expect("type");
    h.peer.write_u32(u32::MAX).await.expect("length");
    timeout(Duration::from_secs(5), h.conn.wait_closed())
        .await
        .expect("connection closed");
    assert_eq!(errors.load(Ordering::SeqCst), 1);
}

#[rstest]
#[tokio::test]
async fn peer_eof_closes_without_error() {
    let errors = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&errors);
    let h = harness(
        echo_router(),
        ConnectionHooks::new().on_error(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
        ConnectionConfig::default(),
    );
    h.conn.start();
    drop(h.peer);
    timeout(Duration::from_secs(5), h.conn.wait_closed())
        .await
        .expect("connection closed");
    assert_eq!(errors.load(Ordering::SeqCst), 0);
}

#[rstest]
#[tokio::test]
async fn write_and_wait_resolves_after_flush() {
    let mut h = harness(
        echo_router(),
        ConnectionHooks::new(),
        ConnectionConfig::default(),
    );
    h.conn.start();
    h.conn
        .write_and_wait(&Note(5))
        .await
        .expect("flushed");
    let (message_type, _) = read_frame(&mut h.peer).await;
    assert_eq!(message_type, 9);
    h.conn.close();
    h.conn.wait_closed().await;
}

#[rstest]
#[tokio::test]
async fn write_and_wait_fails_when_closed_before_start() {
    let h = harness(
        echo_router(),
        ConnectionHooks::new(),
        ConnectionConfig::default(),
    );
    let conn = h.conn.clone();
    let pending = tokio::spawn(async move { conn.write_and_wait(&Note(1)).await });
    tokio::task::yield_now().await;
    h.conn.close();
    let res = pending.await.expect("join");
    assert!(matches!(res, Err(WriteError::Closed)));
    h.conn.wait_closed().await;
    h.tracker.close();
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn timers_fire_and_cancel() {
    let h = harness(
        echo_router(),
        ConnectionHooks::new(),
        ConnectionConfig::default(),
    );
    h.conn.start();
    let (tx, mut rx) = tokio_mpsc::unbounded_channel();

    let fired = tx.clone();
    let once = h
        .conn
        .run_after(Duration::from_millis(20), move |_, conn| {
            let fired = fired.clone();
            async move {
                let _ = fired.send(("once", conn.id()));
            }
        })
        .expect("scheduled");
    let cancelled = h
        .conn
        .run_after(Duration::from_millis(40), move |_, _| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(("cancelled", ConnectionId::new(0)));
            }
        })
        .expect("scheduled");
    assert_eq!(h.conn.pending_timers(), vec![once, cancelled]);
    assert!(h.conn.cancel_timer(cancelled));

    let (label, id) = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timer fired")
        .expect("sender alive");
    assert_eq!((label, id), ("once", ConnectionId::new(1)));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "cancelled timer fired");
    assert!(h.conn.pending_timers().is_empty());
    assert!(!h.conn.cancel_timer(once));

    h.conn.close();
    h.conn.wait_closed().await;
    assert!(h.conn.run_every(Duration::from_millis(10), |_, _| async {}).is_none());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn repeating_timer_runs_until_cancelled() {
    let h = harness(
        echo_router(),
        ConnectionHooks::new(),
        ConnectionConfig::default(),
    );
    h.conn.start();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let id = h
        .conn
        .run_every(Duration::from_millis(10), move |_, _| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .expect("scheduled");
    tokio::time::sleep(Duration::from_millis(105)).await;
    assert!(h.conn.cancel_timer(id));
    let seen = runs.load(Ordering::SeqCst);
    assert!(seen >= 9, "expected about ten firings, saw {seen}");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(runs.load(Ordering::SeqCst) <= seen + 1);
    h.conn.close();
    h.conn.wait_closed().await;
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn unrepresentable_delays_schedule_far_ahead() {
    let h = harness(
        echo_router(),
        ConnectionHooks::new(),
        ConnectionConfig::default(),
    );
    h.conn.start();
    let once = h
        .conn
        .run_after(Duration::MAX, |_, _| async { panic!("fired early"); })
        .expect("scheduled");
    let every = h
        .conn
        .run_every(Duration::from_secs(u64::MAX / 2), |_, _| async {
            panic!("fired early");
        })
        .expect("scheduled");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.conn.pending_timers(), vec![once, every]);
    assert!(!h.conn.is_closed());
    assert!(h.conn.cancel_timer(once));
    assert!(h.conn.cancel_timer(every));
    h.conn.close();
    h.conn.wait_closed().await;
}

#[rstest]
#[tokio::test]
async fn close_cancels_pending_timers() {
    let h = harness(
        echo_router(),
        ConnectionHooks::new(),
        ConnectionConfig::default(),
    );
    h.conn.start();
    h.conn
        .run_after(Duration::from_secs(60), |_, _| async {})
        .expect("scheduled");
    h.conn.close();
    h.conn.wait_closed().await;
    assert!(h.conn.pending_timers().is_empty());
    assert!(h.conn.cancellation_token().is_cancelled());
}

#[rstest]
#[serial]
#[tokio::test]
async fn panicking_handler_closes_the_connection(mut logger: LoggerHandle) {
    let router = Router::new()
        .route(|_: Echo, _: Connection| async { panic!("handler exploded"); })
        .expect("route");
    let mut h = harness(router, ConnectionHooks::new(), ConnectionConfig::default());
    h.conn.start();
    send(&mut h.peer, &h.codec, &Echo("boom".into())).await;
    timeout(Duration::from_secs(5), h.conn.wait_closed())
        .await
        .expect("connection closed after panic");
    let messages = logger.messages();
    assert!(
        messages
            .iter()
            .any(|m| m.contains("handler panicked") && m.contains("panic=handler exploded")),
        "panic not logged: {messages:?}"
    );
}

#[rstest]
#[traced_test]
#[tokio::test]
async fn guarded_callbacks_trace_panics_and_close() {
    let h = harness(
        echo_router(),
        ConnectionHooks::new(),
        ConnectionConfig::default(),
    );
    dispatch::guarded(&h.conn, "timer callback", async { panic!("tick failed"); }).await;
    assert!(logs_contain("timer callback panicked"));
    assert!(logs_contain("tick failed"));
    timeout(Duration::from_secs(5), h.conn.wait_closed())
        .await
        .expect("connection closed after panic");
}

#[rstest]
#[tokio::test]
async fn name_defaults_to_peer_address() {
    let h = harness(
        echo_router(),
        ConnectionHooks::new(),
        ConnectionConfig::default(),
    );
    assert_eq!(h.conn.name(), "127.0.0.1:4000");
    h.conn.set_name("alice");
    assert_eq!(h.conn.name(), "alice");
    assert!(h.conn.server().is_none(), "client sessions have no server");
    h.conn.close();
    h.conn.wait_closed().await;
}

struct Counted(AtomicU32);

#[rstest]
#[tokio::test]
async fn handlers_share_per_connection_data() {
    let router = Router::new()
        .route(|_: Echo, conn: Connection| async move {
            let counted = conn.data::<Counted>().expect("data attached");
            let n = counted.0.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = conn.write(&Note(n));
        })
        .expect("route echo")
        .register::<Note>()
        .expect("register note");
    let (tx, mut rx) = tokio_mpsc::unbounded_channel();
    let mut h = harness(
        router,
        ConnectionHooks::new().on_close(move |conn| {
            let _ = tx.send(conn.data::<Counted>().map(|c| c.0.load(Ordering::SeqCst)));
        }),
        ConnectionConfig::default(),
    );
    assert!(h.conn.insert_data(Counted(AtomicU32::new(0))).is_none());
    h.conn.start();

    for expected in 1..=2 {
        send(&mut h.peer, &h.codec, &Echo("count".into())).await;
        let (message_type, payload) = read_frame(&mut h.peer).await;
        assert_eq!(message_type, 9);
        assert_eq!(Note::from_payload(&payload).expect("decode"), Note(expected));
    }

    h.conn.close();
    h.conn.wait_closed().await;
    assert_eq!(rx.recv().await, Some(Some(2)));
    assert!(h.conn.remove_data::<Counted>().is_some());
    assert!(h.conn.data::<Counted>().is_none());
}

#[rstest]
#[tokio::test]
async fn timers_are_not_starved_by_queued_messages() {
    let gate = Arc::new(Notify::new());
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let blocker = Arc::clone(&gate);
    let echoes = Arc::clone(&order);
    let router = Router::new()
        .route(move |_: Note, _: Connection| {
            let blocker = Arc::clone(&blocker);
            async move { blocker.notified().await }
        })
        .expect("route note")
        .route(move |_: Echo, _: Connection| {
            let echoes = Arc::clone(&echoes);
            async move {
                echoes.lock().expect("order lock").push("echo");
            }
        })
        .expect("route echo");
    let mut h = harness(router, ConnectionHooks::new(), ConnectionConfig::default());
    h.conn.start();

    // The note handler holds the inline dispatch loop while both queues fill.
    send(&mut h.peer, &h.codec, &Note(0)).await;
    for _ in 0..32 {
        send(&mut h.peer, &h.codec, &Echo("queued".into())).await;
    }
    let fired = Arc::clone(&order);
    h.conn
        .run_after(Duration::ZERO, move |_, _| {
            let fired = Arc::clone(&fired);
            async move {
                fired.lock().expect("order lock").push("timer");
            }
        })
        .expect("scheduled");
    tokio::time::sleep(Duration::from_millis(100)).await;
    gate.notify_one();

    let done = wait_until(Duration::from_secs(5), || {
        let order = Arc::clone(&order);
        async move { order.lock().expect("order lock").len() == 33 }
    })
    .await;
    assert!(done, "not every unit ran");
    let order = order.lock().expect("order lock").clone();
    let position = order.iter().position(|&what| what == "timer");
    assert!(
        position.is_some_and(|at| at < 32),
        "timer ran after every queued message: {order:?}"
    );
    h.conn.close();
    h.conn.wait_closed().await;
}

#[rstest]
#[serial]
#[tokio::test]
async fn misrouted_timers_are_reported_and_still_run(mut logger: LoggerHandle) {
    let h = harness(
        echo_router(),
        ConnectionHooks::new(),
        ConnectionConfig::default(),
    );
    let id = h
        .conn
        .run_after(Duration::from_secs(60), |_, _| async {})
        .expect("scheduled");
    assert!(h.conn.cancel_timer(id));
    let (tx, mut rx) = tokio_mpsc::unbounded_channel();
    let expired = Expired {
        id,
        owner: ConnectionId::new(99),
        deadline: Instant::now(),
        fired_at: Instant::now(),
        interval: Duration::ZERO,
        callback: erase_callback(move |_, conn: Connection| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(conn.id());
            }
        }),
    };

    #[cfg(feature = "metrics")]
    let task = {
        let (snapshotter, recorder) = wirelink_testing::debugging_recorder_setup();
        let task = ::metrics::with_local_recorder(&recorder, || {
            dispatch::timer_task(&h.conn, expired)
        });
        let errors = wirelink_testing::counter_value(&snapshotter, crate::metrics::ERRORS_TOTAL);
        let fired = wirelink_testing::counter_value(&snapshotter, crate::metrics::TIMERS_FIRED);
        assert_eq!((errors, fired), (1, 1));
        task
    };
    #[cfg(not(feature = "metrics"))]
    let task = dispatch::timer_task(&h.conn, expired);

    task.expect("misrouted timer still runs").await;
    assert_eq!(rx.recv().await, Some(ConnectionId::new(1)));
    let messages = logger.messages();
    assert!(
        messages
            .iter()
            .any(|m| m.contains("timer delivered to wrong connection")),
        "misrouted timer not logged: {messages:?}"
    );
    h.conn.close();
    h.conn.wait_closed().await;
}
