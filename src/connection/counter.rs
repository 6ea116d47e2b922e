//! Process-wide gauge of running sessions.
//!
//! A session counts as running while its read loop is alive, whether the
//! loop later ends through close, EOF or an error. Server connections and
//! client sessions share one count.

use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

use crate::registry::ConnectionId;

static RUNNING: AtomicU64 = AtomicU64::new(0);

/// Held by the read loop; releases its slot in the gauge on drop.
pub(super) struct SessionGauge {
    id: ConnectionId,
}

impl SessionGauge {
    pub(super) fn enter(id: ConnectionId) -> Self {
        let running = RUNNING.fetch_add(1, Ordering::Relaxed) + 1;
        crate::metrics::inc_connections();
        debug!("session running: id={id}, running={running}");
        Self { id }
    }
}

impl Drop for SessionGauge {
    fn drop(&mut self) {
        let running = RUNNING.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        crate::metrics::dec_connections();
        debug!("session finished: id={}, running={running}", self.id);
    }
}

/// Number of sessions in this process whose read loop is running.
#[must_use]
pub fn active_connection_count() -> u64 { RUNNING.load(Ordering::Relaxed) }
