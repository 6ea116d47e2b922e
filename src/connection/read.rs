//! Read loop: decode frames and route them to the dispatch loop.

use std::sync::Arc;

use futures::StreamExt;
use log::{debug, warn};
use tokio::{io::ReadHalf, sync::mpsc};
use tokio_util::codec::FramedRead;

use super::{
    Connection,
    ConnectionError,
    Transport,
    counter::SessionGauge,
    dispatch::Routed,
    frame::{CodecDecoder, Inbound},
};
use crate::metrics::{self, Direction};

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
pub(super) async fn run(
    conn: Connection,
    reader: ReadHalf<Box<dyn Transport>>,
    handler_tx: mpsc::Sender<Routed>,
) {
    let _gauge = SessionGauge::enter(conn.id());
    let token = conn.cancellation_token();
    let ctx = conn.context();
    let mut frames = FramedRead::new(reader, CodecDecoder::new(Arc::clone(&ctx.codec)));

    loop {
        let next = tokio::select! {
            biased;
            () = token.cancelled() => break,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(Inbound::Message(message))) => {
                conn.touch();
                metrics::inc_frames(Direction::Inbound);
                let message_type = message.message_type();
                let Some(handler) = ctx.router.lookup(message_type).cloned() else {
                    if ctx.hooks.run_on_message(message, &conn).is_some() {
                        warn!(
                            "no handler for message: type={message_type}, id={}",
                            conn.id()
                        );
                    }
                    continue;
                };
                let routed = Routed { message, handler };
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    res = handler_tx.send(routed) => {
                        if res.is_err() {
                            break;
                        }
                    }
                }
            }
            Some(Ok(Inbound::Unrecognized {
                message_type,
                length,
            })) => {
                conn.touch();
                debug!(
                    "skipped unrecognized frame: type={message_type}, length={length}, id={}",
                    conn.id()
                );
            }
            Some(Err(err)) => {
                conn.fail(&ConnectionError::from(err));
                break;
            }
            None => {
                debug!("peer closed connection: id={}", conn.id());
                break;
            }
        }
    }
}
