//! Message-type routing table.
//!
//! A [`Router`] maps a wire type tag to a payload decoder and, optionally, a
//! handler. The codec uses the decoders; connections use the handlers. A
//! router is populated before any traffic flows and then shared immutably
//! behind an [`Arc`](std::sync::Arc).

use std::{collections::HashMap, future::Future, sync::Arc};

use futures::{FutureExt, future::BoxFuture};
use log::warn;
use thiserror::Error;

use crate::{
    connection::Connection,
    message::{BoxError, Message, WireMessage},
};

/// Type-erased asynchronous message handler.
pub type Handler = Arc<dyn Fn(Box<dyn Message>, Connection) -> BoxFuture<'static, ()> + Send + Sync>;

/// Type-erased payload decoder.
pub type Decoder =
    Arc<dyn Fn(&[u8]) -> std::result::Result<Box<dyn Message>, BoxError> + Send + Sync>;

/// Errors raised while building a [`Router`].
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum RouterError {
    /// A route with the provided type tag was already registered.
    #[error("route id {0} was already registered")]
    DuplicateRoute(u32),
}

/// Result type used by the router builder methods.
pub type Result<T> = std::result::Result<T, RouterError>;

struct Route {
    decoder: Decoder,
    handler: Option<Handler>,
}

/// Table mapping message type tags to decoders and handlers.
///
/// # Examples
///
/// ```
/// use wirelink::{
///     connection::Connection,
///     message::WireMessage,
///     router::Router,
/// };
///
/// #[derive(Debug, bincode::Encode, bincode::Decode)]
/// struct Echo(String);
///
/// impl WireMessage for Echo {
///     const MESSAGE_TYPE: u32 = 7;
/// }
///
/// let router = Router::new()
///     .route(|msg: Echo, conn: Connection| async move {
///         let _ = conn.write(&msg);
///     })
///     .expect("route");
/// assert!(router.contains(7));
/// ```
#[derive(Default)]
pub struct Router {
    routes: HashMap<u32, Route>,
}

impl Router {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Register a decoder for `M` without a handler.
    ///
    /// Decoded messages of this type fall through to the `on_message` hook.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::DuplicateRoute`] if `M::MESSAGE_TYPE` is taken.
    pub fn register<M: WireMessage>(self) -> Result<Self> {
        self.route_raw(M::MESSAGE_TYPE, wire_decoder::<M>(), None)
    }

    /// Register `handler` for messages of type `M`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::DuplicateRoute`] if `M::MESSAGE_TYPE` is taken.
    pub fn route<M, F, Fut>(self, handler: F) -> Result<Self>
    where
        M: WireMessage,
        F: Fn(M, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |message: Box<dyn Message>, conn: Connection| {
            match message.downcast::<M>() {
                Some(message) => handler(*message, conn).boxed(),
                None => {
                    warn!(
                        "handler received mismatched message: expected_type={}, id={}",
                        M::MESSAGE_TYPE,
                        conn.id()
                    );
                    futures::future::ready(()).boxed()
                }
            }
        });
        self.route_raw(M::MESSAGE_TYPE, wire_decoder::<M>(), Some(handler))
    }

    /// Register a hand-written decoder and optional handler for `message_type`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::DuplicateRoute`] if `message_type` is taken.
    pub fn route_raw(
        mut self,
        message_type: u32,
        decoder: Decoder,
        handler: Option<Handler>,
    ) -> Result<Self> {
        if self.routes.contains_key(&message_type) {
            return Err(RouterError::DuplicateRoute(message_type));
        }
        self.routes.insert(message_type, Route { decoder, handler });
        Ok(self)
    }

    /// Look up the handler registered for `message_type`.
    #[must_use]
    pub fn lookup(&self, message_type: u32) -> Option<&Handler> {
        self.routes.get(&message_type)?.handler.as_ref()
    }

    /// Decode `payload` with the decoder registered for `message_type`.
    ///
    /// Returns `None` when no decoder is registered.
    #[must_use]
    pub fn decode(
        &self,
        message_type: u32,
        payload: &[u8],
    ) -> Option<std::result::Result<Box<dyn Message>, BoxError>> {
        self.routes
            .get(&message_type)
            .map(|route| (route.decoder)(payload))
    }

    /// Return `true` if `message_type` has a registered decoder.
    #[must_use]
    pub fn contains(&self, message_type: u32) -> bool { self.routes.contains_key(&message_type) }

    /// Number of registered type tags.
    #[must_use]
    pub fn len(&self) -> usize { self.routes.len() }

    /// Return `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.routes.is_empty() }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.routes.keys().copied().collect();
        types.sort_unstable();
        f.debug_struct("Router").field("types", &types).finish()
    }
}

fn wire_decoder<M: WireMessage>() -> Decoder {
    Arc::new(|payload: &[u8]| {
        M::from_payload(payload).map(|message| Box::new(message) as Box<dyn Message>)
    })
}

#[cfg(test)]
mod tests {
    use bincode::{Decode, Encode};

    use super::*;

    #[derive(Debug, PartialEq, Encode, Decode)]
    struct Ping(u32);

    impl WireMessage for Ping {
        const MESSAGE_TYPE: u32 = 1;
    }

    #[derive(Debug, PartialEq, Encode, Decode)]
    struct Note(String);

    impl WireMessage for Note {
        const MESSAGE_TYPE: u32 = 2;
    }

    #[test]
    fn duplicate_route_is_rejected() {
        let err = Router::new()
            .register::<Ping>()
            .expect("first registration")
            .route(|_: Ping, _| async {})
            .expect_err("duplicate must fail");
        assert_eq!(err, RouterError::DuplicateRoute(1));
    }

    #[test]
    fn register_adds_decoder_without_handler() {
        let router = Router::new()
            .register::<Note>()
            .expect("register")
            .route(|_: Ping, _| async {})
            .expect("route");
        assert!(router.contains(2));
        assert!(router.lookup(2).is_none());
        assert!(router.lookup(1).is_some());
        assert_eq!(router.len(), 2);
    }

    #[test]
    fn decode_uses_registered_decoder() {
        let router = Router::new().register::<Ping>().expect("register");
        let payload = Ping(42).serialize().expect("encode");
        let decoded = router
            .decode(1, &payload)
            .expect("decoder registered")
            .expect("valid payload");
        assert_eq!(decoded.downcast_ref::<Ping>(), Some(&Ping(42)));
        assert!(router.decode(9, &payload).is_none());
    }

    #[test]
    fn raw_routes_accept_custom_decoders() {
        let decoder: Decoder = Arc::new(|bytes: &[u8]| {
            let text = String::from_utf8(bytes.to_vec())?;
            Ok(Box::new(Note(text)) as Box<dyn Message>)
        });
        let router = Router::new()
            .route_raw(2, decoder, None)
            .expect("route_raw");
        let decoded = router
            .decode(2, b"hi")
            .expect("decoder registered")
            .expect("utf8");
        assert_eq!(decoded.downcast_ref::<Note>(), Some(&Note("hi".into())));
    }
}
