//! Hashed timing wheel.
//!
//! Time is divided into ticks of fixed length measured from the instant the
//! wheel started. A timer due at tick `t` lives in slot `t & mask`. On every
//! tick the wheel visits only the slots between the last processed tick and
//! the current one, expiring entries whose deadline tick has passed and
//! leaving later revolutions in place. Cancellation removes the timer from
//! the index; the slot entry is discarded lazily when its slot is visited.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use log::debug;
use tokio::{
    sync::mpsc,
    time::{Instant, interval_at},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{Expired, TimerCallback, TimerId, WheelConfig, deadline_after};
use crate::registry::ConnectionId;

struct Entry {
    deadline_tick: u64,
    deadline: Instant,
    interval: Duration,
    owner: ConnectionId,
    callback: TimerCallback,
}

struct State {
    next_id: u64,
    current_tick: u64,
    timers: HashMap<TimerId, Entry>,
    slots: Vec<Vec<TimerId>>,
}

struct Inner {
    state: Mutex<State>,
    origin: Instant,
    tick: Duration,
    mask: u64,
    token: CancellationToken,
}

/// Shared handle to a running timing wheel.
///
/// Cloning the handle is cheap; all clones refer to the same wheel.
#[derive(Clone)]
pub struct TimingWheel {
    inner: Arc<Inner>,
}

impl TimingWheel {
    /// Start a wheel ticking on `tracker` until `token` is cancelled.
    ///
    /// Returns the wheel handle and the receiver of expired timers. Expired
    /// timers are delivered in the order their ticks pass; the ticker waits
    /// for queue capacity rather than dropping records.
    #[must_use]
    pub fn start(
        config: WheelConfig,
        token: CancellationToken,
        tracker: &TaskTracker,
    ) -> (Self, mpsc::Receiver<Expired>) {
        let config = config.normalized();
        let (tx, rx) = mpsc::channel(config.delivery_capacity);
        let origin = Instant::now();
        let wheel = Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    next_id: 0,
                    current_tick: 0,
                    timers: HashMap::new(),
                    slots: vec![Vec::new(); config.slots],
                }),
                origin,
                tick: config.tick,
                mask: (config.slots as u64) - 1,
                token,
            }),
        };
        tracker.spawn(run_ticker(wheel.clone(), tx));
        (wheel, rx)
    }

    /// Schedule `callback` for `owner` at `deadline`.
    ///
    /// A non-zero `interval` re-arms the timer after every expiry. Deadlines
    /// in the past fire on the next tick.
    pub fn add_timer(
        &self,
        deadline: Instant,
        interval: Duration,
        owner: ConnectionId,
        callback: TimerCallback,
    ) -> TimerId {
        let deadline_tick = self.ticks_until(deadline);
        let mut state = self.lock();
        let id = TimerId(state.next_id);
        state.next_id += 1;
        let deadline_tick = deadline_tick.max(state.current_tick + 1);
        state.insert(
            id,
            Entry {
                deadline_tick,
                deadline,
                interval,
                owner,
                callback,
            },
            self.inner.mask,
        );
        id
    }

    /// Cancel a pending timer.
    ///
    /// Returns `false` if the timer already fired (one-shot), was cancelled
    /// before, or never existed.
    pub fn cancel_timer(&self, id: TimerId) -> bool { self.lock().timers.remove(&id).is_some() }

    /// Number of outstanding timers.
    #[must_use]
    pub fn len(&self) -> usize { self.lock().timers.len() }

    /// Return `true` if no timers are outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Stop the wheel, discarding every outstanding timer.
    ///
    /// Expiries not yet handed to the delivery queue are dropped.
    pub fn stop(&self) {
        self.inner.token.cancel();
        let mut state = self.lock();
        state.timers.clear();
        state.slots.iter_mut().for_each(Vec::clear);
    }

    /// Return `true` once the wheel has been stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool { self.inner.token.is_cancelled() }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tick index at or after `deadline`.
    fn ticks_until(&self, deadline: Instant) -> u64 {
        let elapsed = deadline.saturating_duration_since(self.inner.origin);
        let ticks = elapsed.as_nanos().div_ceil(self.inner.tick.as_nanos());
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }

    /// Tick index containing `now`.
    fn tick_at(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.inner.origin);
        let ticks = elapsed.as_nanos() / self.inner.tick.as_nanos();
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }

    /// Advance to `now`, returning every timer that expired on the way.
    fn advance(&self, now: Instant) -> Vec<Expired> {
        let now_tick = self.tick_at(now);
        let mask = self.inner.mask;
        let mut state = self.lock();
        if now_tick <= state.current_tick {
            return Vec::new();
        }

        let gap = now_tick - state.current_tick;
        let slot_count = mask + 1;
        let (first, visits) = if gap >= slot_count {
            (0, slot_count)
        } else {
            (state.current_tick + 1, gap)
        };

        let mut expired = Vec::new();
        let mut rearm = Vec::new();
        for offset in 0..visits {
            let index = usize::try_from((first + offset) & mask).unwrap_or_default();
            state.expire_slot(index, now_tick, now, mask, &mut expired, &mut rearm);
        }
        state.current_tick = now_tick;

        for (id, mut entry) in rearm {
            entry.deadline = deadline_after(entry.deadline, entry.interval);
            entry.deadline_tick = self.ticks_until(entry.deadline).max(now_tick + 1);
            state.insert(id, entry, mask);
        }
        expired
    }
}

impl State {
    fn insert(&mut self, id: TimerId, entry: Entry, mask: u64) {
        let index = usize::try_from(entry.deadline_tick & mask).unwrap_or_default();
        if let Some(slot) = self.slots.get_mut(index) {
            slot.push(id);
        }
        self.timers.insert(id, entry);
    }

    fn expire_slot(
        &mut self,
        index: usize,
        now_tick: u64,
        now: Instant,
        mask: u64,
        expired: &mut Vec<Expired>,
        rearm: &mut Vec<(TimerId, Entry)>,
    ) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        let ids = std::mem::take(slot);
        let mut kept = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(entry) = self.timers.get(&id) else {
                continue;
            };
            if usize::try_from(entry.deadline_tick & mask).ok() != Some(index) {
                continue;
            }
            if entry.deadline_tick > now_tick {
                kept.push(id);
                continue;
            }
            let Some(entry) = self.timers.remove(&id) else {
                continue;
            };
            expired.push(Expired {
                id,
                owner: entry.owner,
                deadline: entry.deadline,
                fired_at: now,
                interval: entry.interval,
                callback: Arc::clone(&entry.callback),
            });
            if !entry.interval.is_zero() {
                rearm.push((id, entry));
            }
        }
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = kept;
        }
    }
}

impl std::fmt::Debug for TimingWheel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimingWheel")
            .field("tick", &self.inner.tick)
            .field("slots", &(self.inner.mask + 1))
            .field("pending", &self.len())
            .finish()
    }
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
async fn run_ticker(wheel: TimingWheel, tx: mpsc::Sender<Expired>) {
    let token = wheel.inner.token.clone();
    let mut ticker = interval_at(wheel.inner.origin + wheel.inner.tick, wheel.inner.tick);
    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        for record in wheel.advance(Instant::now()) {
            tokio::select! {
                biased;
                () = token.cancelled() => return,
                res = tx.send(record) => {
                    if res.is_err() {
                        debug!("timer delivery queue closed; stopping wheel");
                        return;
                    }
                }
            }
        }
    }
}
