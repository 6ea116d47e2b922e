//! Timed callbacks.
//!
//! Timers are owned by connections and stored in a [`TimingWheel`]. The wheel
//! emits [`Expired`] records on a bounded delivery queue; the owner routes each
//! record to the connection's dispatch loop, which runs the callback.

use std::{fmt, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use log::debug;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{connection::Connection, registry::ConnectionId};

mod wheel;

pub use wheel::TimingWheel;

/// Identifier of a scheduled timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    /// Return the inner `u64` representation.
    #[must_use]
    pub fn as_u64(&self) -> u64 { self.0 }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "TimerId({})", self.0) }
}

/// Type-erased timer callback.
///
/// Receives the instant at which the timer fired and the owning connection.
pub type TimerCallback = Arc<dyn Fn(Instant, Connection) -> BoxFuture<'static, ()> + Send + Sync>;

/// A timer whose deadline has passed.
#[derive(Clone)]
pub struct Expired {
    /// Identifier of the timer.
    pub id: TimerId,
    /// Connection the timer was scheduled for.
    pub owner: ConnectionId,
    /// Deadline the timer was scheduled to fire at.
    pub deadline: Instant,
    /// Instant the wheel observed the expiry.
    pub fired_at: Instant,
    /// Repeat interval; zero for one-shot timers.
    pub interval: Duration,
    /// Callback to run.
    pub callback: TimerCallback,
}

impl Expired {
    /// Return `true` if the timer re-arms after firing.
    #[must_use]
    pub fn is_repeating(&self) -> bool { !self.interval.is_zero() }
}

impl fmt::Debug for Expired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expired")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("deadline", &self.deadline)
            .field("fired_at", &self.fired_at)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// Timing wheel configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WheelConfig {
    /// Granularity of the wheel.
    pub tick: Duration,
    /// Number of slots; rounded up to a power of two.
    pub slots: usize,
    /// Capacity of the expiry delivery queue.
    pub delivery_capacity: usize,
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(10),
            slots: 512,
            delivery_capacity: 1024,
        }
    }
}

impl WheelConfig {
    /// Clamp values to usable bounds.
    ///
    /// The tick lies between one millisecond and one hour, the slot count is
    /// a power of two of at least two, and the delivery queue holds at least
    /// one record.
    #[must_use]
    pub fn normalized(self) -> Self {
        Self {
            tick: self
                .tick
                .clamp(Duration::from_millis(1), Duration::from_secs(3600)),
            slots: self.slots.max(2).next_power_of_two(),
            delivery_capacity: self.delivery_capacity.max(1),
        }
    }
}

/// Furthest a deadline is placed ahead when `Instant` cannot represent it.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `from + delay`, clamped to a far-future instant instead of overflowing.
pub(crate) fn deadline_after(from: Instant, delay: Duration) -> Instant {
    from.checked_add(delay)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

/// Forward expired timers to their owning connections until `token` fires.
///
/// Records whose owner `lookup` cannot find are logged and dropped.
#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
pub(crate) async fn route_expired<F>(
    mut rx: mpsc::Receiver<Expired>,
    token: CancellationToken,
    lookup: F,
) where
    F: Fn(ConnectionId) -> Option<Connection>,
{
    loop {
        let expired = tokio::select! {
            biased;
            () = token.cancelled() => break,
            next = rx.recv() => match next {
                Some(expired) => expired,
                None => break,
            },
        };
        match lookup(expired.owner) {
            Some(conn) => conn.deliver_timer(expired),
            None => debug!(
                "dropping timer for unknown connection: timer={}, owner={}",
                expired.id, expired.owner
            ),
        }
    }
}
