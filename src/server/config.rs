//! Builder for [`Server`].

use std::{
    future::Future,
    sync::{Arc, Mutex, Weak, atomic::AtomicBool},
    time::Duration,
};

use tokio::time::Instant;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{BackoffConfig, Scheduled, Server, ServerShared};
use crate::{
    codec::{Codec, TypeLengthValueCodec},
    connection::{Connection, ConnectionConfig, Context, Role, erase_callback},
    hooks::ConnectionHooks,
    registry::{ConnectionRegistry, IdGenerator},
    router::Router,
    timer::{TimingWheel, WheelConfig, route_expired},
    worker::{WorkerPool, default_size},
};

/// Default cap on live connections per server.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;

/// Configures and builds a [`Server`].
///
/// ```no_run
/// use wirelink::{router::Router, server::Server};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let server = Server::builder()
///     .router(Router::new())
///     .max_connections(64)
///     .build();
/// let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
/// server.start(listener).await?;
/// # Ok(())
/// # }
/// ```
#[must_use]
pub struct ServerBuilder {
    router: Arc<Router>,
    codec: Option<Arc<dyn Codec>>,
    hooks: ConnectionHooks,
    pool: Option<Arc<WorkerPool>>,
    workers: usize,
    max_connections: usize,
    connection: ConnectionConfig,
    backoff: BackoffConfig,
    wheel: WheelConfig,
    zero_linger: bool,
    ids: Option<Arc<IdGenerator>>,
    #[cfg(feature = "tls")]
    tls: Option<tokio_rustls::TlsAcceptor>,
    scheduled: Option<Scheduled>,
}

impl Default for ServerBuilder {
    fn default() -> Self { Self::new() }
}

impl ServerBuilder {
    /// Create a builder with default settings and an empty router.
    pub fn new() -> Self {
        Self {
            router: Arc::new(Router::new()),
            codec: None,
            hooks: ConnectionHooks::default(),
            pool: None,
            workers: default_size(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection: ConnectionConfig::default(),
            backoff: BackoffConfig::default(),
            wheel: WheelConfig::default(),
            zero_linger: true,
            ids: None,
            #[cfg(feature = "tls")]
            tls: None,
            scheduled: None,
        }
    }

    /// Route inbound messages through `router`.
    ///
    /// Also used by the default [`TypeLengthValueCodec`].
    pub fn router(mut self, router: impl Into<Arc<Router>>) -> Self {
        self.router = router.into();
        self
    }

    /// Frame messages with `codec` instead of the default
    /// [`TypeLengthValueCodec`].
    pub fn codec(mut self, codec: impl Codec) -> Self {
        self.codec = Some(Arc::new(codec));
        self
    }

    /// Install connection lifecycle hooks.
    pub fn hooks(mut self, hooks: ConnectionHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Run handlers on a shared `pool`.
    ///
    /// The server does not shut down a pool it was given.
    pub fn worker_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Size of the pool the server creates when none is supplied.
    ///
    /// Defaults to the available parallelism; clamped to at least one.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Refuse sockets once this many connections are live.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Queue capacities and flush timeout for each connection.
    pub fn connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection = config;
        self
    }

    /// Configure accept-loop back-off behaviour.
    pub fn accept_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff.normalized();
        self
    }

    /// Configure the server's timing wheel.
    pub fn wheel(mut self, wheel: WheelConfig) -> Self {
        self.wheel = wheel.normalized();
        self
    }

    /// Close sockets abortively (`SO_LINGER` of zero). Enabled by default.
    pub fn zero_linger(mut self, enabled: bool) -> Self {
        self.zero_linger = enabled;
        self
    }

    /// Draw connection identifiers from `ids`, shared with other servers or
    /// clients.
    pub fn id_generator(mut self, ids: Arc<IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Wrap accepted sockets in TLS.
    #[cfg(feature = "tls")]
    pub fn tls_acceptor(mut self, acceptor: tokio_rustls::TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Run `callback` every `interval` on each accepted connection.
    pub fn schedule<F, Fut>(mut self, interval: Duration, callback: F) -> Self
    where
        F: Fn(Instant, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.scheduled = Some(Scheduled {
            interval,
            callback: erase_callback(callback),
        });
        self
    }

    /// Build the server and start its timing wheel.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn build(self) -> Server {
        let registry = Arc::new(ConnectionRegistry::new());
        let (pool, owns_pool) = match self.pool {
            Some(pool) => (pool, false),
            None => (Arc::new(WorkerPool::new(self.workers)), true),
        };
        let codec = self
            .codec
            .unwrap_or_else(|| Arc::new(TypeLengthValueCodec::new(Arc::clone(&self.router))));

        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let (wheel, expired) = TimingWheel::start(self.wheel, token.child_token(), &tracker);
        let lookup = Arc::clone(&registry);
        tracker.spawn(route_expired(expired, token.clone(), move |id| {
            lookup.get(&id)
        }));

        let shared = Arc::new_cyclic(|server: &Weak<ServerShared>| {
            let context = Arc::new(Context {
                codec,
                router: self.router,
                hooks: self.hooks,
                config: self.connection.normalized(),
                role: Role::Server {
                    pool: Arc::clone(&pool),
                    registry: Arc::clone(&registry),
                    server: Weak::clone(server),
                },
            });
            ServerShared {
                context,
                registry,
                pool,
                owns_pool,
                ids: self.ids.unwrap_or_default(),
                wheel,
                accept_token: token.child_token(),
                token,
                tracker,
                max_connections: self.max_connections,
                backoff: self.backoff,
                zero_linger: self.zero_linger,
                #[cfg(feature = "tls")]
                tls: self.tls,
                scheduled: Mutex::new(self.scheduled),
                stopped: AtomicBool::new(false),
                local_addrs: Mutex::new(Vec::new()),
            }
        });
        Server::from_shared(shared)
    }
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("router", &self.router)
            .field("max_connections", &self.max_connections)
            .field("connection", &self.connection)
            .field("backoff", &self.backoff)
            .field("wheel", &self.wheel)
            .field("zero_linger", &self.zero_linger)
            .finish_non_exhaustive()
    }
}
