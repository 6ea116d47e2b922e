//! Application message abstraction.
//!
//! A [`Message`] is anything that can report a stable numeric type tag and
//! serialise itself to bytes. Codecs frame those bytes on the wire and the
//! [`crate::router::Router`] turns inbound payloads back into messages.
//!
//! Most applications derive `bincode` traits and implement [`WireMessage`],
//! which provides [`Message`] through a blanket implementation. Types with a
//! hand-written wire format implement [`Message`] directly and register a
//! decoder with [`crate::router::Router::route_raw`].

use std::{any::Any, error::Error, fmt};

use bincode::{Decode, Encode, config, decode_from_slice, encode_to_vec};

/// Boxed error used at the serialisation seams.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Conversion to [`Any`] for downcasting decoded messages.
///
/// Implemented for every `'static + Send + Sync` type; it only exists so that
/// `dyn Message` can be downcast to its concrete type.
pub trait AsAny: Any + Send + Sync {
    /// Borrow `self` as [`Any`].
    fn as_any(&self) -> &dyn Any;

    /// Convert a boxed value into a boxed [`Any`].
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any { self }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> { self }
}

/// A unit of application data carried by one frame.
pub trait Message: AsAny + fmt::Debug {
    /// Stable numeric tag identifying the message variant on the wire.
    fn message_type(&self) -> u32;

    /// Serialise the message payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be encoded.
    fn serialize(&self) -> Result<Vec<u8>, BoxError>;
}

impl dyn Message {
    /// Return `true` if the message is of type `T`.
    #[must_use]
    pub fn is<T: Message>(&self) -> bool { <dyn Message as AsAny>::as_any(self).is::<T>() }

    /// Borrow the message as `T` if it has that concrete type.
    #[must_use]
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        <dyn Message as AsAny>::as_any(self).downcast_ref::<T>()
    }

    /// Take ownership of the message as `T` if it has that concrete type.
    #[must_use]
    pub fn downcast<T: Message>(self: Box<Self>) -> Option<Box<T>> {
        <dyn Message as AsAny>::into_any(self).downcast::<T>().ok()
    }
}

/// Message whose payload is encoded with `bincode`'s standard configuration.
///
/// # Examples
///
/// ```
/// use wirelink::message::{Message, WireMessage};
///
/// #[derive(Debug, PartialEq, bincode::Encode, bincode::Decode)]
/// struct Chat {
///     text: String,
/// }
///
/// impl WireMessage for Chat {
///     const MESSAGE_TYPE: u32 = 3;
/// }
///
/// let chat = Chat { text: "hi".into() };
/// assert_eq!(chat.message_type(), 3);
/// let bytes = chat.serialize().expect("encode");
/// assert_eq!(Chat::from_payload(&bytes).expect("decode"), chat);
/// ```
pub trait WireMessage: Encode + Decode<()> + fmt::Debug + Send + Sync + 'static {
    /// Type tag written in front of every frame carrying this message.
    const MESSAGE_TYPE: u32;

    /// Decode the message from a frame payload.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not a valid encoding of `Self`.
    fn from_payload(bytes: &[u8]) -> Result<Self, BoxError> {
        let (message, _) = decode_from_slice(bytes, config::standard())?;
        Ok(message)
    }
}

impl<T: WireMessage> Message for T {
    fn message_type(&self) -> u32 { T::MESSAGE_TYPE }

    fn serialize(&self) -> Result<Vec<u8>, BoxError> {
        Ok(encode_to_vec(self, config::standard())?)
    }
}
