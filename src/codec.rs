//! Pluggable framing codecs for wire protocols.
//!
//! A [`Codec`] turns a [`Message`] into the bytes of exactly one frame and
//! incrementally extracts messages from a read buffer. The default
//! [`TypeLengthValueCodec`] writes a 4-byte type tag, a 4-byte payload length
//! and the payload, all big-endian.
//!
//! # Error Handling
//!
//! Decoding failures are reported through [`CodecError`]. A frame with an
//! unknown type tag yields [`CodecError::UnrecognizedFrame`] *after* the frame
//! has been consumed, so connections treat it as a liveness signal and keep
//! reading. Every other error closes the connection.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    byte_order::{HEADER_FIELD_SIZE, peek_network_u32, write_network_u32},
    message::Message,
    router::Router,
};

pub mod error;

pub use error::{CodecError, EofError, FramingError};

/// Size of the type tag plus length prefix written before every payload.
pub const HEADER_SIZE: usize = 2 * HEADER_FIELD_SIZE;

/// Largest payload accepted by [`TypeLengthValueCodec`] (8 MiB).
///
/// The bound is checked against the length prefix before any buffer space is
/// reserved, so a corrupt header cannot trigger an unbounded allocation.
pub const MAX_PAYLOAD_LENGTH: usize = 1 << 23;

/// Trait for pluggable frame codecs.
///
/// Implementations must be stateless with respect to individual connections:
/// a single instance is shared by every connection of a server or client.
pub trait Codec: Send + Sync + 'static {
    /// Encode `message` into the bytes of one complete frame.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Serialize`] if the payload cannot be produced or
    /// [`CodecError::Framing`] if it violates the framing limits.
    fn encode(&self, message: &dyn Message) -> Result<Bytes, CodecError>;

    /// Try to decode one message from the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are required. Consumed bytes must be
    /// removed from `src`, including the bytes of an unrecognised frame.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`]; see the module docs for which variants are
    /// fatal.
    fn decode(&self, src: &mut BytesMut) -> Result<Option<Box<dyn Message>>, CodecError>;

    /// Number of bytes needed before any frame can be decoded.
    ///
    /// Used to classify EOF errors.
    fn header_len(&self) -> usize { HEADER_SIZE }

    /// Payload length announced by the header at the front of `buf`.
    ///
    /// Returns `None` when the codec cannot tell; used to classify EOF errors.
    fn payload_len(&self, _buf: &[u8]) -> Option<usize> { None }
}

/// Default codec: type tag, length prefix, payload.
///
/// Payload decoding is delegated to the [`Router`]; type tags without a
/// registered decoder produce [`CodecError::UnrecognizedFrame`].
#[derive(Clone)]
pub struct TypeLengthValueCodec {
    router: Arc<Router>,
    max_payload_length: usize,
}

impl TypeLengthValueCodec {
    /// Construct a codec decoding payloads through `router`.
    #[must_use]
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            max_payload_length: MAX_PAYLOAD_LENGTH,
        }
    }

    /// Lower the maximum accepted payload length.
    ///
    /// Values above [`MAX_PAYLOAD_LENGTH`] are clamped to it.
    #[must_use]
    pub fn with_max_payload_length(mut self, max: usize) -> Self {
        self.max_payload_length = max.min(MAX_PAYLOAD_LENGTH);
        self
    }

    /// Return the maximum payload length accepted by this codec.
    #[must_use]
    pub fn max_payload_length(&self) -> usize { self.max_payload_length }

    fn check_length(&self, size: usize) -> Result<(), CodecError> {
        if size > self.max_payload_length {
            return Err(FramingError::OversizedFrame {
                size,
                max: self.max_payload_length,
            }
            .into());
        }
        Ok(())
    }
}

impl std::fmt::Debug for TypeLengthValueCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeLengthValueCodec")
            .field("routes", &self.router.len())
            .field("max_payload_length", &self.max_payload_length)
            .finish()
    }
}

impl Codec for TypeLengthValueCodec {
    fn encode(&self, message: &dyn Message) -> Result<Bytes, CodecError> {
        let message_type = message.message_type();
        let payload = message
            .serialize()
            .map_err(|source| CodecError::Serialize {
                message_type,
                source,
            })?;
        self.check_length(payload.len())?;
        let length = u32::try_from(payload.len()).map_err(|_| FramingError::OversizedFrame {
            size: payload.len(),
            max: self.max_payload_length,
        })?;

        let mut frame = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        frame.put_slice(&write_network_u32(message_type));
        frame.put_slice(&write_network_u32(length));
        frame.put_slice(&payload);
        Ok(frame.freeze())
    }

    fn decode(&self, src: &mut BytesMut) -> Result<Option<Box<dyn Message>>, CodecError> {
        let (Some(message_type), Some(length)) = (
            peek_network_u32(src, 0),
            peek_network_u32(src, HEADER_FIELD_SIZE),
        ) else {
            src.reserve(HEADER_SIZE - src.len());
            return Ok(None);
        };
        let length = length as usize;
        self.check_length(length)?;

        let frame_len = HEADER_SIZE + length;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(length);
        match self.router.decode(message_type, &payload) {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(source)) => Err(CodecError::Deserialize {
                message_type,
                source,
            }),
            None => Err(CodecError::UnrecognizedFrame {
                message_type,
                length,
            }),
        }
    }

    fn payload_len(&self, buf: &[u8]) -> Option<usize> {
        peek_network_u32(buf, HEADER_FIELD_SIZE).map(|length| length as usize)
    }
}
