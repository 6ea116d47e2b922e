//! Messages with fixed type tags used across the test suites.

use bincode::{Decode, Encode};
use wirelink::{connection::Connection, message::WireMessage, router::Router};

/// Text message carried as type 7.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Chat {
    pub text: String,
}

impl Chat {
    pub fn new(text: impl Into<String>) -> Self { Self { text: text.into() } }
}

impl WireMessage for Chat {
    const MESSAGE_TYPE: u32 = 7;
}

/// Sequence-numbered message carried as type 8.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Tick(pub u64);

impl WireMessage for Tick {
    const MESSAGE_TYPE: u32 = 8;
}

/// Router that writes every [`Chat`] back to its sender and decodes
/// [`Tick`] without a handler.
///
/// # Panics
///
/// Never; both type tags are distinct.
#[must_use]
pub fn echo_router() -> Router {
    Router::new()
        .route(|msg: Chat, conn: Connection| async move {
            if let Err(e) = conn.write(&msg) {
                log::warn!("echo failed: id={}, error={e}", conn.id());
            }
        })
        .and_then(Router::register::<Tick>)
        .expect("distinct type tags")
}
