//! Builder for configuring and connecting a [`Client`].

use std::{
    sync::{
        Arc,
        RwLock,
        atomic::{AtomicBool, AtomicU64},
    },
    time::Duration,
};

use log::info;
use tokio::{net::ToSocketAddrs, sync::Notify};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{
    Client,
    ClientError,
    ClientInner,
    SocketOptions,
    runtime::{Dialer, resolve, supervise},
};
use crate::{
    codec::{Codec, TypeLengthValueCodec},
    connection::{ConnectionConfig, Context, Role},
    hooks::ConnectionHooks,
    registry::IdGenerator,
    router::Router,
    server::BackoffConfig,
    timer::WheelConfig,
};

/// Back-off between reconnect attempts unless configured otherwise.
pub const DEFAULT_RECONNECT_BACKOFF: BackoffConfig = BackoffConfig {
    initial_delay: Duration::from_millis(100),
    max_delay: Duration::from_secs(5),
};

/// Configures and connects a [`Client`].
///
/// # Examples
///
/// ```no_run
/// use wirelink::{client::Client, router::Router};
///
/// # async fn run() -> Result<(), wirelink::client::ClientError> {
/// let client = Client::builder()
///     .router(Router::new())
///     .reconnect(true)
///     .connect("127.0.0.1:7000")
///     .await?;
/// client.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[must_use]
pub struct ClientBuilder {
    router: Arc<Router>,
    codec: Option<Arc<dyn Codec>>,
    hooks: ConnectionHooks,
    connection: ConnectionConfig,
    wheel: WheelConfig,
    socket: SocketOptions,
    reconnect: bool,
    backoff: BackoffConfig,
    ids: Option<Arc<IdGenerator>>,
    #[cfg(feature = "tls")]
    tls: Option<(
        tokio_rustls::TlsConnector,
        tokio_rustls::rustls::pki_types::ServerName<'static>,
    )>,
}

impl Default for ClientBuilder {
    fn default() -> Self { Self::new() }
}

impl ClientBuilder {
    /// Create a builder with default settings and an empty router.
    pub fn new() -> Self {
        Self {
            router: Arc::new(Router::new()),
            codec: None,
            hooks: ConnectionHooks::default(),
            connection: ConnectionConfig::default(),
            wheel: WheelConfig::default(),
            socket: SocketOptions::default(),
            reconnect: false,
            backoff: DEFAULT_RECONNECT_BACKOFF,
            ids: None,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Route inbound messages through `router`.
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

    /// Install session lifecycle hooks.
    pub fn hooks(mut self, hooks: ConnectionHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Queue capacities and flush timeout for each session.
    pub fn connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection = config;
        self
    }

    /// Configure each session's timing wheel.
    pub fn wheel(mut self, wheel: WheelConfig) -> Self {
        self.wheel = wheel.normalized();
        self
    }

    /// Socket options applied before every dial.
    pub fn socket_options(mut self, options: SocketOptions) -> Self {
        self.socket = options;
        self
    }

    /// Re-dial after a session closes. Disabled by default.
    pub fn reconnect(mut self, enabled: bool) -> Self {
        self.reconnect = enabled;
        self
    }

    /// Back-off between reconnect attempts.
    pub fn reconnect_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff.normalized();
        self
    }

    /// Draw the client's identifier from `ids`.
    ///
    /// Without one the client uses a private generator and gets
    /// `ConnectionId(0)`.
    pub fn id_generator(mut self, ids: Arc<IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Wrap every session in TLS, verifying the peer as `server_name`.
    #[cfg(feature = "tls")]
    pub fn tls_connector(
        mut self,
        connector: tokio_rustls::TlsConnector,
        server_name: tokio_rustls::rustls::pki_types::ServerName<'static>,
    ) -> Self {
        self.tls = Some((connector, server_name));
        self
    }

    /// Dial `addr` and start the first session.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connect`] if resolving or dialing fails,
    /// [`ClientError::Tls`] if the handshake fails and
    /// [`ClientError::Rejected`] if `on_connect` refuses the session.
    pub async fn connect(self, addr: impl ToSocketAddrs) -> Result<Client, ClientError> {
        let addr = resolve(addr).await?;
        let codec = self
            .codec
            .unwrap_or_else(|| Arc::new(TypeLengthValueCodec::new(Arc::clone(&self.router))));
        let context = Arc::new(Context {
            codec,
            router: self.router,
            hooks: self.hooks,
            config: self.connection.normalized(),
            role: Role::Client,
        });
        let closed = Arc::new(Notify::new());
        let dialer = Dialer {
            addr,
            id: self.ids.unwrap_or_default().next(),
            context,
            wheel: self.wheel,
            socket: self.socket,
            #[cfg(feature = "tls")]
            tls: self.tls,
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            closed: Arc::clone(&closed),
        };

        let session = dialer.dial().await?;
        if !dialer.context.hooks.run_on_connect(&session) {
            info!("session rejected by on_connect: id={}, addr={addr}", dialer.id);
            session.close();
            return Err(ClientError::Rejected);
        }
        session.start();
        info!("client connected: id={}, addr={addr}", dialer.id);

        let token = dialer.token.clone();
        let tracker = dialer.tracker.clone();
        let inner = Arc::new(ClientInner {
            dialer,
            backoff: self.backoff,
            reconnect: AtomicBool::new(self.reconnect),
            generation: AtomicU64::new(0),
            session: RwLock::new(session),
        });
        tracker.spawn(supervise(Arc::downgrade(&inner), closed, token));
        Ok(Client { inner })
    }
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("router", &self.router)
            .field("connection", &self.connection)
            .field("wheel", &self.wheel)
            .field("socket", &self.socket)
            .field("reconnect", &self.reconnect)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}
