//! Per-connection queue and shutdown settings.

use std::time::Duration;

/// Default capacity of the send, handler and timer queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default bound on the advisory flush performed at shutdown.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Settings shared by every connection of a server or client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Capacity of the outbound packet queue. A full queue makes
    /// [`Connection::write`](super::Connection::write) fail with
    /// [`WriteError::WouldBlock`](super::WriteError::WouldBlock).
    pub send_queue: usize,
    /// Capacity of the queue between the read loop and the dispatch loop.
    pub handler_queue: usize,
    /// Capacity of the queue carrying expired timers to the dispatch loop.
    pub timer_queue: usize,
    /// Upper bound on the time spent writing queued packets after close.
    pub flush_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            send_queue: DEFAULT_QUEUE_CAPACITY,
            handler_queue: DEFAULT_QUEUE_CAPACITY,
            timer_queue: DEFAULT_QUEUE_CAPACITY,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }
}

impl ConnectionConfig {
    /// Clamp every queue capacity to at least one.
    #[must_use]
    pub fn normalized(self) -> Self {
        Self {
            send_queue: self.send_queue.max(1),
            handler_queue: self.handler_queue.max(1),
            timer_queue: self.timer_queue.max(1),
            flush_timeout: self.flush_timeout,
        }
    }
}
