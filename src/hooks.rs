//! Connection lifecycle hooks.
//!
//! [`ConnectionHooks`] stores optional callbacks invoked by the connection
//! engine, while [`ConnectionHandler`] exposes a trait applications may
//! implement instead of registering closures one at a time.

use std::sync::Arc;

use crate::{
    connection::{Connection, ConnectionError},
    message::Message,
};

/// Trait encapsulating connection lifecycle callbacks.
///
/// Every method has an empty default so implementations only override what
/// they need.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Called once a connection is registered and before its loops start.
    ///
    /// Returning `false` rejects the connection; it is closed without
    /// exchanging any frames.
    fn on_connect(&self, _conn: &Connection) -> bool { true }

    /// Fallback for decoded messages whose type has no handler.
    fn on_message(&self, _message: Box<dyn Message>, _conn: &Connection) {}

    /// Called exactly once when the connection begins its teardown.
    fn on_close(&self, _conn: &Connection) {}

    /// Called when a read, decode or write failure terminates the connection.
    ///
    /// A clean EOF at a frame boundary is not reported.
    fn on_error(&self, _conn: &Connection, _error: &ConnectionError) {}
}

/// Type alias for the `on_connect` callback.
type OnConnectHook = Arc<dyn Fn(&Connection) -> bool + Send + Sync>;

/// Type alias for the `on_message` callback.
type OnMessageHook = Arc<dyn Fn(Box<dyn Message>, &Connection) + Send + Sync>;

/// Type alias for the `on_close` callback.
type OnCloseHook = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Type alias for the `on_error` callback.
type OnErrorHook = Arc<dyn Fn(&Connection, &ConnectionError) + Send + Sync>;

/// Callbacks shared by every connection of a server or client.
#[derive(Clone, Default)]
pub struct ConnectionHooks {
    /// Invoked when a connection is established.
    pub on_connect: Option<OnConnectHook>,
    /// Invoked for messages with no registered handler.
    pub on_message: Option<OnMessageHook>,
    /// Invoked once when a connection closes.
    pub on_close: Option<OnCloseHook>,
    /// Invoked when a connection fails.
    pub on_error: Option<OnErrorHook>,
}

impl ConnectionHooks {
    /// Create an empty hook set.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Register the `on_connect` callback.
    #[must_use]
    pub fn on_connect<F>(mut self, f: F) -> Self
    where
        F: Fn(&Connection) -> bool + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(f));
        self
    }

    /// Register the `on_message` fallback.
    #[must_use]
    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(Box<dyn Message>, &Connection) + Send + Sync + 'static,
    {
        self.on_message = Some(Arc::new(f));
        self
    }

    /// Register the `on_close` callback.
    #[must_use]
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(f));
        self
    }

    /// Register the `on_error` callback.
    #[must_use]
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&Connection, &ConnectionError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Run the `on_connect` hook, accepting the connection if none is set.
    pub fn run_on_connect(&self, conn: &Connection) -> bool {
        self.on_connect.as_ref().is_none_or(|hook| hook(conn))
    }

    /// Run the `on_message` hook if registered.
    ///
    /// Returns the message back when no fallback is installed.
    pub fn run_on_message(
        &self,
        message: Box<dyn Message>,
        conn: &Connection,
    ) -> Option<Box<dyn Message>> {
        match &self.on_message {
            Some(hook) => {
                hook(message, conn);
                None
            }
            None => Some(message),
        }
    }

    /// Run the `on_close` hook if registered.
    pub fn run_on_close(&self, conn: &Connection) {
        if let Some(hook) = &self.on_close {
            hook(conn);
        }
    }

    /// Run the `on_error` hook if registered.
    pub fn run_on_error(&self, conn: &Connection, error: &ConnectionError) {
        if let Some(hook) = &self.on_error {
            hook(conn, error);
        }
    }

    /// Construct hooks from a [`ConnectionHandler`] implementation.
    pub fn from_handler<H>(handler: &Arc<H>) -> Self
    where
        H: ConnectionHandler + ?Sized,
    {
        let connect = Arc::clone(handler);
        let message = Arc::clone(handler);
        let close = Arc::clone(handler);
        let error = Arc::clone(handler);
        Self {
            on_connect: Some(Arc::new(move |conn: &Connection| connect.on_connect(conn))),
            on_message: Some(Arc::new(move |msg: Box<dyn Message>, conn: &Connection| {
                message.on_message(msg, conn);
            })),
            on_close: Some(Arc::new(move |conn: &Connection| close.on_close(conn))),
            on_error: Some(Arc::new(move |conn: &Connection, err: &ConnectionError| {
                error.on_error(conn, err);
            })),
        }
    }
}

impl std::fmt::Debug for ConnectionHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHooks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}
