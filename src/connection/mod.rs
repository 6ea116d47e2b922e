//! Connection engine.
//!
//! A [`Connection`] owns a transport and three cooperating loops:
//!
//! - the **read loop** decodes frames through the configured [`Codec`] and
//!   forwards routed messages to the dispatch loop,
//! - the **write loop** drains the bounded send queue to the socket, and
//! - the **dispatch loop** runs message handlers and expired timers, either on
//!   the owning server's [`WorkerPool`] or inline for client sessions.
//!
//! Connections are cheap handles; clones refer to the same session. Closing is
//! idempotent and never blocks: [`Connection::close`] schedules a single
//! teardown task and [`Connection::wait_closed`] observes its completion.
//!
//! [`Codec`]: crate::codec::Codec

mod config;
mod counter;
mod data;
mod dispatch;
mod error;
mod frame;
mod read;
mod shutdown;
mod write;

use std::{
    collections::HashSet,
    fmt,
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

pub use config::{ConnectionConfig, DEFAULT_FLUSH_TIMEOUT, DEFAULT_QUEUE_CAPACITY};
pub use counter::active_connection_count;
pub use error::{ConnectionError, WriteError};
use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    time::Instant,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use self::{data::ConnectionData, dispatch::Routed, write::Packet};
use crate::{
    codec::Codec,
    hooks::ConnectionHooks,
    message::Message,
    panic::catch_panic,
    registry::{ConnectionId, ConnectionRegistry},
    router::Router,
    server::{Server, ServerShared},
    timer::{Expired, TimerCallback, TimerId, TimingWheel, deadline_after},
    worker::WorkerPool,
};

/// Byte stream a connection can run over.
///
/// Implemented for every `AsyncRead + AsyncWrite` type that is `Send`,
/// `Unpin` and `'static`, including `TcpStream` and TLS streams.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Collaborators shared by every connection of one server or client.
pub(crate) struct Context {
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) router: Arc<Router>,
    pub(crate) hooks: ConnectionHooks,
    pub(crate) config: ConnectionConfig,
    pub(crate) role: Role,
}

/// Server connections dispatch on the shared pool, deregister on close and
/// can reach their server; client sessions dispatch inline.
pub(crate) enum Role {
    Server {
        pool: Arc<WorkerPool>,
        registry: Arc<ConnectionRegistry>,
        server: Weak<ServerShared>,
    },
    Client,
}

/// Hook run after teardown completes.
pub(crate) type ClosedHook = Box<dyn FnOnce(Connection) + Send>;

/// Everything needed to assemble a [`Connection`].
pub(crate) struct ConnectionParts {
    pub(crate) id: ConnectionId,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) local_addr: SocketAddr,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) context: Arc<Context>,
    pub(crate) wheel: TimingWheel,
    /// Stop `wheel` on close; set for client sessions.
    pub(crate) owns_wheel: bool,
    pub(crate) token: CancellationToken,
    /// Tracker the teardown task is spawned on.
    pub(crate) spawner: TaskTracker,
    pub(crate) on_closed: Option<ClosedHook>,
}

/// Resources held until [`Connection::start`] hands them to the loops.
struct Startup {
    transport: Box<dyn Transport>,
    send_rx: mpsc::Receiver<Packet>,
    handler_rx: mpsc::Receiver<Routed>,
    timer_rx: mpsc::Receiver<Expired>,
}

struct State {
    name: String,
    heartbeat: Instant,
    pending_timers: HashSet<TimerId>,
    data: ConnectionData,
    startup: Option<Startup>,
    on_closed: Option<ClosedHook>,
}

struct Shared {
    id: ConnectionId,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    context: Arc<Context>,
    wheel: TimingWheel,
    owns_wheel: bool,
    token: CancellationToken,
    closing: AtomicBool,
    closed: CancellationToken,
    send_tx: mpsc::Sender<Packet>,
    handler_tx: mpsc::Sender<Routed>,
    timer_tx: mpsc::Sender<Expired>,
    tracker: TaskTracker,
    spawner: TaskTracker,
    state: Mutex<State>,
}

/// Handle to one client or server session.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub(crate) fn new(parts: ConnectionParts) -> Self {
        let ConnectionParts {
            id,
            transport,
            local_addr,
            peer_addr,
            context,
            wheel,
            owns_wheel,
            token,
            spawner,
            on_closed,
        } = parts;
        let config = context.config.normalized();
        let (send_tx, send_rx) = mpsc::channel(config.send_queue);
        let (handler_tx, handler_rx) = mpsc::channel(config.handler_queue);
        let (timer_tx, timer_rx) = mpsc::channel(config.timer_queue);
        Self {
            shared: Arc::new(Shared {
                id,
                local_addr,
                peer_addr,
                context,
                wheel,
                owns_wheel,
                token,
                closing: AtomicBool::new(false),
                closed: CancellationToken::new(),
                send_tx,
                handler_tx,
                timer_tx,
                tracker: TaskTracker::new(),
                spawner,
                state: Mutex::new(State {
                    name: peer_addr.to_string(),
                    heartbeat: Instant::now(),
                    pending_timers: HashSet::new(),
                    data: ConnectionData::default(),
                    startup: Some(Startup {
                        transport,
                        send_rx,
                        handler_rx,
                        timer_rx,
                    }),
                    on_closed,
                }),
            }),
        }
    }

    /// Identifier of this connection.
    #[must_use]
    pub fn id(&self) -> ConnectionId { self.shared.id }

    /// Display name; defaults to the peer address.
    #[must_use]
    pub fn name(&self) -> String { self.lock_state().name.clone() }

    /// Replace the display name.
    pub fn set_name(&self, name: impl Into<String>) { self.lock_state().name = name.into(); }

    /// Instant of the most recent inbound frame, recognised or not.
    #[must_use]
    pub fn heartbeat(&self) -> Instant { self.lock_state().heartbeat }

    /// Local socket address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr { self.shared.local_addr }

    /// Remote socket address.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr { self.shared.peer_addr }

    /// Attach `value` to this connection, replacing any value of type `T`.
    ///
    /// Returns the replaced value. Values stay readable after close.
    pub fn insert_data<T>(&self, value: T) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.lock_state().data.insert(value)
    }

    /// Value of type `T` attached to this connection.
    #[must_use]
    pub fn data<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.lock_state().data.get()
    }

    /// Detach and return the value of type `T`.
    pub fn remove_data<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.lock_state().data.remove()
    }

    /// Server that accepted this connection.
    ///
    /// Returns `None` for client sessions and once every handle to the
    /// server has been dropped.
    #[must_use]
    pub fn server(&self) -> Option<Server> {
        match &self.shared.context.role {
            Role::Server { server, .. } => server.upgrade().map(Server::from_shared),
            Role::Client => None,
        }
    }

    /// Return `true` once [`Connection::close`] has been triggered.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.shared.closing.load(Ordering::Acquire) }

    /// Token cancelled when the connection begins its teardown.
    ///
    /// Server connections derive theirs from the server token, so stopping
    /// the server cancels every connection.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken { self.shared.token.clone() }

    /// Identifiers of timers scheduled on this connection that have not
    /// finished or been cancelled.
    #[must_use]
    pub fn pending_timers(&self) -> Vec<TimerId> {
        let mut ids: Vec<_> = self.lock_state().pending_timers.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Encode `message` and enqueue it without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::WouldBlock`] if the send queue is full,
    /// [`WriteError::Closed`] if the connection is closed and
    /// [`WriteError::Codec`] if encoding fails.
    pub fn write(&self, message: &dyn Message) -> Result<(), WriteError> {
        let bytes = self.encode(message)?;
        self.enqueue(Packet::new(bytes, None))
    }

    /// Encode `message`, enqueue it and wait until it has been flushed.
    ///
    /// Admission is identical to [`Connection::write`]; a full queue fails
    /// immediately rather than waiting for capacity.
    ///
    /// # Errors
    ///
    /// As for [`Connection::write`]. Additionally returns
    /// [`WriteError::Closed`] if the connection closes before the packet is
    /// written.
    pub async fn write_and_wait(&self, message: &dyn Message) -> Result<(), WriteError> {
        let bytes = self.encode(message)?;
        let (tx, rx) = oneshot::channel();
        self.enqueue(Packet::new(bytes, Some(tx)))?;
        rx.await.map_err(|_| WriteError::Closed)
    }

    /// Enqueue a pre-encoded frame.
    pub(crate) fn write_frame(&self, bytes: bytes::Bytes) -> Result<(), WriteError> {
        if self.is_closed() {
            return Err(WriteError::Closed);
        }
        self.enqueue(Packet::new(bytes, None))
    }

    fn encode(&self, message: &dyn Message) -> Result<bytes::Bytes, WriteError> {
        if self.is_closed() {
            return Err(WriteError::Closed);
        }
        Ok(self.shared.context.codec.encode(message)?)
    }

    fn enqueue(&self, packet: Packet) -> Result<(), WriteError> {
        self.shared.send_tx.try_send(packet).map_err(|e| match e {
            TrySendError::Full(_) => WriteError::WouldBlock,
            TrySendError::Closed(_) => WriteError::Closed,
        })
    }

    /// Schedule `callback` to run once at `deadline`.
    ///
    /// Returns `None` if the connection is already closed.
    pub fn run_at<F, Fut>(&self, deadline: Instant, callback: F) -> Option<TimerId>
    where
        F: Fn(Instant, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_timer(deadline, Duration::ZERO, erase_callback(callback))
    }

    /// Schedule `callback` to run once after `delay`.
    ///
    /// Returns `None` if the connection is already closed.
    pub fn run_after<F, Fut>(&self, delay: Duration, callback: F) -> Option<TimerId>
    where
        F: Fn(Instant, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.run_at(deadline_after(Instant::now(), delay), callback)
    }

    /// Schedule `callback` every `interval`, first firing one interval from
    /// now, until cancelled or the connection closes.
    ///
    /// A zero interval schedules a single immediate firing. Returns `None` if
    /// the connection is already closed.
    pub fn run_every<F, Fut>(&self, interval: Duration, callback: F) -> Option<TimerId>
    where
        F: Fn(Instant, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_timer(
            deadline_after(Instant::now(), interval),
            interval,
            erase_callback(callback),
        )
    }

    pub(crate) fn add_timer(
        &self,
        deadline: Instant,
        interval: Duration,
        callback: TimerCallback,
    ) -> Option<TimerId> {
        let mut state = self.lock_state();
        if self.is_closed() {
            return None;
        }
        let id = self
            .shared
            .wheel
            .add_timer(deadline, interval, self.id(), callback);
        state.pending_timers.insert(id);
        Some(id)
    }

    /// Cancel a timer scheduled on this connection.
    ///
    /// Returns `false` if the timer is not pending on this connection.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        let removed = self.lock_state().pending_timers.remove(&id);
        if removed {
            self.shared.wheel.cancel_timer(id);
        }
        removed
    }

    /// Start the read, write and dispatch loops.
    ///
    /// Does nothing if the connection was already started or closed.
    pub(crate) fn start(&self) {
        let Some(startup) = self.lock_state().startup.take() else {
            return;
        };
        if self.is_closed() {
            return;
        }
        let Startup {
            transport,
            send_rx,
            handler_rx,
            timer_rx,
        } = startup;
        let (reader, writer) = tokio::io::split(transport);
        self.spawn_loop(
            "read",
            read::run(self.clone(), reader, self.shared.handler_tx.clone()),
        );
        self.spawn_loop("write", write::run(self.clone(), writer, send_rx));
        self.spawn_loop("dispatch", dispatch::run(self.clone(), handler_rx, timer_rx));
        info!(
            "connection started: id={}, peer_addr={}",
            self.id(),
            self.peer_addr()
        );
    }

    /// Begin closing the connection.
    ///
    /// Idempotent and non-blocking; safe to call from handlers and timer
    /// callbacks. Must be called from within a Tokio runtime.
    pub fn close(&self) {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let conn = self.clone();
        self.shared.spawner.spawn(shutdown::teardown(conn));
    }

    /// Wait until teardown has finished.
    ///
    /// Never returns for a connection that is not closed.
    pub async fn wait_closed(&self) { self.shared.closed.cancelled().await; }

    pub(crate) fn context(&self) -> &Context { &self.shared.context }

    /// Hand an expired timer to the dispatch loop.
    ///
    /// Waits for queue capacity on a separate task rather than dropping.
    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus internally"
    )]
    pub(crate) fn deliver_timer(&self, expired: Expired) {
        match self.shared.timer_tx.try_send(expired) {
            Ok(()) => {}
            Err(TrySendError::Full(expired)) => {
                let tx = self.shared.timer_tx.clone();
                let token = self.cancellation_token();
                self.shared.spawner.spawn(async move {
                    tokio::select! {
                        biased;
                        () = token.cancelled() => {}
                        _ = tx.send(expired) => {}
                    }
                });
            }
            Err(TrySendError::Closed(expired)) => {
                debug!(
                    "timer dropped for closed connection: timer={}, id={}",
                    expired.id,
                    self.id()
                );
            }
        }
    }

    /// Record inbound activity.
    fn touch(&self) { self.lock_state().heartbeat = Instant::now(); }

    /// Decide whether a delivered timer should still run.
    fn claim_timer(&self, expired: &Expired) -> bool {
        let mut state = self.lock_state();
        if expired.is_repeating() {
            state.pending_timers.contains(&expired.id)
        } else {
            state.pending_timers.remove(&expired.id)
        }
    }

    /// Report a terminal failure.
    fn fail(&self, err: &ConnectionError) {
        crate::metrics::inc_errors();
        warn!("connection error: id={}, error={err}", self.id());
        self.shared.context.hooks.run_on_error(self, err);
    }

    fn spawn_loop<F>(&self, task: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let conn = self.clone();
        self.shared.tracker.spawn(async move {
            if let Err(panic) = catch_panic(fut).await {
                crate::metrics::inc_connection_panics();
                // Emit via both `log` and `tracing` for tests that capture either.
                error!(
                    "connection task panicked: task={task}, id={}, panic={panic}",
                    conn.id()
                );
                tracing::error!(task, id = %conn.id(), panic = %panic, "connection task panicked");
            }
            conn.close();
        });
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("peer_addr", &self.peer_addr())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

pub(crate) fn erase_callback<F, Fut>(callback: F) -> TimerCallback
where
    F: Fn(Instant, Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |fired_at: Instant, conn: Connection| callback(fired_at, conn).boxed())
}

#[cfg(test)]
mod tests;
