//! Ordered connection teardown.

use log::info;

use super::{Connection, Role};

/// Tear down `conn`; runs exactly once per connection.
///
/// Order: `on_close` hook, deregistration, cancellation (which makes the
/// loops drop their socket halves), timer cancellation, loop join, then the
/// post-close hook used for client reconnects.
pub(super) async fn teardown(conn: Connection) {
    let shared = &conn.shared;
    shared.context.hooks.run_on_close(&conn);

    if let Role::Server { registry, .. } = &shared.context.role {
        registry.remove(&conn.id());
    }

    // A connection closed before `start` still owns its transport.
    let (unstarted, on_closed, pending) = {
        let mut state = conn.lock_state();
        (
            state.startup.take(),
            state.on_closed.take(),
            std::mem::take(&mut state.pending_timers),
        )
    };
    drop(unstarted);

    shared.token.cancel();

    for id in pending {
        shared.wheel.cancel_timer(id);
    }
    if shared.owns_wheel {
        shared.wheel.stop();
    }

    shared.tracker.close();
    shared.tracker.wait().await;
    shared.closed.cancel();
    info!(
        "connection closed: id={}, peer_addr={}",
        conn.id(),
        conn.peer_addr()
    );

    if let Some(hook) = on_closed {
        hook(conn.clone());
    }
}
