//! Dispatch loop: run handlers and timer callbacks.
//!
//! Server connections hand every unit of work to the shared worker pool keyed
//! by connection ID, which preserves per-connection order. Client sessions run
//! each unit inline on the loop.

use std::future::Future;

use futures::FutureExt;
use log::{debug, error};
use tokio::sync::mpsc;

use super::{Connection, Role};
use crate::{
    message::Message,
    panic::catch_panic,
    router::Handler,
    timer::Expired,
    worker::{PoolError, Task},
};

/// A decoded message paired with its handler.
pub(super) struct Routed {
    pub(super) message: Box<dyn Message>,
    pub(super) handler: Handler,
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
pub(super) async fn run(
    conn: Connection,
    mut handler_rx: mpsc::Receiver<Routed>,
    mut timer_rx: mpsc::Receiver<Expired>,
) {
    let token = conn.cancellation_token();
    loop {
        // Unbiased: neither queue may starve the other.
        let task = tokio::select! {
            () = token.cancelled() => break,
            Some(routed) = handler_rx.recv() => handler_task(&conn, routed),
            Some(expired) = timer_rx.recv() => match timer_task(&conn, expired) {
                Some(task) => task,
                None => continue,
            },
            else => break,
        };
        let submitted = tokio::select! {
            biased;
            () = token.cancelled() => break,
            res = submit(&conn, task) => res,
        };
        if submitted.is_err() {
            debug!("worker pool closed; stopping dispatch: id={}", conn.id());
            break;
        }
    }
}

async fn submit(conn: &Connection, task: Task) -> Result<(), PoolError> {
    match &conn.context().role {
        Role::Server { pool, .. } => pool.put(conn.id(), task).await,
        Role::Client => {
            task.await;
            Ok(())
        }
    }
}

fn handler_task(conn: &Connection, routed: Routed) -> Task {
    let Routed { message, handler } = routed;
    guarded(conn, "handler", handler(message, conn.clone()))
}

pub(super) fn timer_task(conn: &Connection, expired: Expired) -> Option<Task> {
    if expired.owner == conn.id() {
        if !conn.claim_timer(&expired) {
            debug!(
                "skipping cancelled timer: timer={}, id={}",
                expired.id,
                conn.id()
            );
            return None;
        }
    } else {
        crate::metrics::inc_errors();
        error!(
            "timer delivered to wrong connection: timer={}, owner={}, id={}",
            expired.id,
            expired.owner,
            conn.id()
        );
    }
    crate::metrics::inc_timers_fired();
    Some(guarded(
        conn,
        "timer callback",
        (expired.callback)(expired.fired_at, conn.clone()),
    ))
}

/// Wrap user code so a panic is logged and closes the connection.
pub(super) fn guarded<F>(conn: &Connection, what: &'static str, fut: F) -> Task
where
    F: Future<Output = ()> + Send + 'static,
{
    let conn = conn.clone();
    async move {
        if let Err(panic) = catch_panic(fut).await {
            crate::metrics::inc_connection_panics();
            // Emit via both `log` and `tracing` for tests that capture either.
            error!("{what} panicked: id={}, panic={panic}", conn.id());
            tracing::error!(id = %conn.id(), panic = %panic, "{what} panicked");
            conn.close();
        }
    }
    .boxed()
}
