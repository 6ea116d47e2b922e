//! Raw access to the default type-length-value wire format.

use tokio::io::{AsyncRead, AsyncReadExt};
use wirelink::message::{Message, WireMessage};

/// Build a frame with an arbitrary type tag around `payload`.
#[must_use]
pub fn raw_frame(message_type: u32, payload: &[u8]) -> Vec<u8> {
    let length = u32::try_from(payload.len()).expect("payload fits in u32");
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&message_type.to_be_bytes());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Frame `message` the way the default codec does.
#[must_use]
pub fn encode_frame(message: &dyn Message) -> Vec<u8> {
    let payload = message.serialize().expect("serialise test message");
    raw_frame(message.message_type(), &payload)
}

/// Read one frame, returning its type tag and payload.
///
/// # Errors
///
/// Returns any I/O error, including `UnexpectedEof` if the peer closes.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<(u32, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let message_type = reader.read_u32().await?;
    let length = reader.read_u32().await?;
    let mut payload = vec![0; length as usize];
    reader.read_exact(&mut payload).await?;
    Ok((message_type, payload))
}

/// Read one frame and decode it as `M`.
///
/// # Panics
///
/// Panics if the frame carries a different type tag or does not decode.
pub async fn read_message<M, R>(reader: &mut R) -> std::io::Result<M>
where
    M: WireMessage,
    R: AsyncRead + Unpin,
{
    let (message_type, payload) = read_frame(reader).await?;
    assert_eq!(message_type, M::MESSAGE_TYPE, "unexpected frame type");
    Ok(M::from_payload(&payload).expect("decode test message"))
}
