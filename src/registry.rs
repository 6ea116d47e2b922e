//! Connection identifiers and the live-connection registry.
//!
//! [`ConnectionRegistry`] maps [`ConnectionId`]s to started [`Connection`]s and
//! backs broadcast, unicast and admission control. Admission is a two-step
//! protocol: [`ConnectionRegistry::try_reserve`] atomically claims a slot
//! against the configured maximum, and [`Reservation::commit`] inserts the
//! connection. Dropping a reservation releases the slot, so a socket refused
//! by `on_connect` or a failed TLS handshake never leaks capacity.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use dashmap::DashMap;

use crate::connection::Connection;

/// Identifier assigned to a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self { Self(value) }
}

impl ConnectionId {
    /// Create a new [`ConnectionId`] with the provided value.
    #[must_use]
    pub fn new(id: u64) -> Self { Self(id) }

    /// Return the inner `u64` representation.
    #[must_use]
    pub fn as_u64(&self) -> u64 { self.0 }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "ConnectionId({})", self.0) }
}

/// Monotonic source of [`ConnectionId`]s.
///
/// One generator is shared (via `Arc`) by every server and client that must
/// hand out distinct identifiers.
///
/// ```
/// use wirelink::registry::IdGenerator;
///
/// let ids = IdGenerator::new();
/// assert_eq!(ids.next().as_u64(), 0);
/// assert_eq!(ids.next().as_u64(), 1);
/// ```
#[derive(Debug, Default)]
pub struct IdGenerator(AtomicU64);

impl IdGenerator {
    /// Create a generator starting at zero.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Allocate the next identifier.
    pub fn next(&self) -> ConnectionId { ConnectionId(self.0.fetch_add(1, Ordering::Relaxed)) }
}

/// Concurrent registry of live connections keyed by [`ConnectionId`].
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Connection>,
    live: AtomicUsize,
}

/// A claimed registry slot awaiting [`Reservation::commit`].
#[must_use = "dropping a reservation releases the slot"]
pub struct Reservation {
    registry: Arc<ConnectionRegistry>,
    committed: bool,
}

impl Reservation {
    /// Insert `conn`, consuming the reservation.
    pub fn commit(mut self, conn: Connection) {
        self.committed = true;
        self.registry.connections.insert(conn.id(), conn);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.live.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Claim a slot if fewer than `max` connections are live or reserved.
    pub fn try_reserve(self: &Arc<Self>, max: usize) -> Option<Reservation> {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < max).then_some(live + 1)
            })
            .ok()
            .map(|_| Reservation {
                registry: Arc::clone(self),
                committed: false,
            })
    }

    /// Remove the connection registered under `id`.
    ///
    /// Returns `true` if an entry was removed.
    pub fn remove(&self, id: &ConnectionId) -> bool {
        let removed = self.connections.remove(id).is_some();
        if removed {
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Retrieve the connection registered under `id`.
    #[must_use]
    pub fn get(&self, id: &ConnectionId) -> Option<Connection> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    /// Number of live connections, including outstanding reservations.
    #[must_use]
    pub fn len(&self) -> usize { self.live.load(Ordering::Acquire) }

    /// Return `true` if no connection is live or reserved.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Clone every registered connection.
    ///
    /// Holds per-shard read locks while iterating.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Connection> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Remove and return every registered connection.
    pub fn drain(&self) -> Vec<Connection> {
        let mut drained = Vec::with_capacity(self.connections.len());
        self.connections.retain(|_, conn| {
            drained.push(conn.clone());
            false
        });
        self.live.fetch_sub(drained.len(), Ordering::AcqRel);
        drained
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("live", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn reservations_respect_the_maximum() {
        let registry = Arc::new(ConnectionRegistry::new());
        let first = registry.try_reserve(2).expect("first slot");
        let second = registry.try_reserve(2).expect("second slot");
        assert!(registry.try_reserve(2).is_none());
        assert_eq!(registry.len(), 2);
        drop(first);
        assert_eq!(registry.len(), 1);
        assert!(registry.try_reserve(2).is_some());
        drop(second);
        assert!(registry.is_empty());
    }

    #[rstest]
    fn zero_maximum_refuses_everything() {
        let registry = Arc::new(ConnectionRegistry::new());
        assert!(registry.try_reserve(0).is_none());
    }

    #[test]
    fn ids_are_monotonic() {
        let ids = IdGenerator::new();
        let a = ids.next();
        let b = ids.next();
        assert!(a < b);
        assert_eq!(a.to_string(), "ConnectionId(0)");
    }
}
