//! Adapter driving a [`Codec`] through `tokio_util`'s framed reader.

use std::sync::Arc;

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::{
    codec::{Codec, CodecError, EofError},
    message::Message,
};

/// Item produced by [`CodecDecoder`].
///
/// Unrecognised frames surface as an item rather than an error because
/// `FramedRead` ends the stream after the first error.
#[derive(Debug)]
pub(super) enum Inbound {
    Message(Box<dyn Message>),
    Unrecognized { message_type: u32, length: usize },
}

pub(super) struct CodecDecoder {
    codec: Arc<dyn Codec>,
}

impl CodecDecoder {
    pub(super) fn new(codec: Arc<dyn Codec>) -> Self { Self { codec } }

    fn eof_error(&self, buf: &[u8]) -> EofError {
        let header_size = self.codec.header_len();
        if buf.len() < header_size {
            return EofError::MidHeader {
                bytes_received: buf.len(),
                header_size,
            };
        }
        EofError::MidFrame {
            bytes_received: buf.len() - header_size,
            expected: self.codec.payload_len(buf).unwrap_or_default(),
        }
    }
}

impl Decoder for CodecDecoder {
    type Item = Inbound;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.codec.decode(src) {
            Ok(message) => Ok(message.map(Inbound::Message)),
            Err(CodecError::UnrecognizedFrame {
                message_type,
                length,
            }) => Ok(Some(Inbound::Unrecognized {
                message_type,
                length,
            })),
            Err(e) => Err(e),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(item) => Ok(Some(item)),
            None if buf.is_empty() => Ok(None),
            None => Err(self.eof_error(buf).into()),
        }
    }
}
