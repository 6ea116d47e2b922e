//! Write loop: drain the send queue to the socket.

use std::io;

use bytes::Bytes;
use log::debug;
use tokio::{
    io::{AsyncWriteExt, WriteHalf},
    sync::{mpsc, oneshot},
    time::timeout,
};

use super::{Connection, ConnectionError, Transport};
use crate::metrics::{self, Direction};

/// Encoded frame awaiting transmission.
pub(super) struct Packet {
    bytes: Bytes,
    done: Option<oneshot::Sender<()>>,
}

impl Packet {
    pub(super) fn new(bytes: Bytes, done: Option<oneshot::Sender<()>>) -> Self { Self { bytes, done } }

    fn complete(self) {
        if let Some(done) = self.done {
            let _ = done.send(());
        }
    }
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
pub(super) async fn run(
    conn: Connection,
    mut writer: WriteHalf<Box<dyn Transport>>,
    mut rx: mpsc::Receiver<Packet>,
) {
    let token = conn.cancellation_token();
    loop {
        let packet = tokio::select! {
            biased;
            () = token.cancelled() => break,
            packet = rx.recv() => packet,
        };
        let Some(packet) = packet else { break };
        let res = tokio::select! {
            biased;
            () = token.cancelled() => {
                debug!("write interrupted by close: id={}", conn.id());
                return;
            }
            res = write_packet(&mut writer, &packet.bytes) => res,
        };
        if let Err(e) = res {
            conn.fail(&ConnectionError::Io(e));
            return;
        }
        packet.complete();
    }
    drain(&conn, &mut writer, &mut rx).await;
}

async fn write_packet(writer: &mut WriteHalf<Box<dyn Transport>>, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await?;
    metrics::inc_frames(Direction::Outbound);
    Ok(())
}

/// Best-effort flush of packets queued before close.
///
/// Failures are logged at debug level; waiters on undrained packets observe
/// a closed connection.
async fn drain(
    conn: &Connection,
    writer: &mut WriteHalf<Box<dyn Transport>>,
    rx: &mut mpsc::Receiver<Packet>,
) {
    rx.close();
    let flush = async {
        let mut flushed = 0_usize;
        while let Some(packet) = rx.recv().await {
            write_packet(writer, &packet.bytes).await?;
            packet.complete();
            flushed += 1;
        }
        writer.shutdown().await?;
        Ok::<_, io::Error>(flushed)
    };
    match timeout(conn.context().config.flush_timeout, flush).await {
        Ok(Ok(0)) => {}
        Ok(Ok(flushed)) => debug!("flushed queued packets on close: id={}, count={flushed}", conn.id()),
        Ok(Err(e)) => debug!("advisory flush failed: id={}, error={e}", conn.id()),
        Err(_) => debug!("advisory flush timed out: id={}", conn.id()),
    }
}
