//! A fast-path reader-writer lock layered over a distributed reservation.
//!
//! A [`FastReservation`] is for locks that are contended locally far more
//! often than they move between nodes: the common acquire and release paths
//! are single atomic operations on a 64-bit state word, and the base
//! [`Reservation`] is only consulted when the lock actually needs to cross
//! nodes (or when the `use_fast_reservation_fallback` config diverts all
//! traffic through it for debugging).
//!
//! The state word holds the reader count plus a handful of flag bits.
//! Ordinary reads and writes race on the word alone; every *exceptional*
//! transition (the base reservation owns the lock, a holder is asleep, the
//! remote side wants the lock back) is serialized by a private mutex so the
//! flag bits hold still while they are classified.
//!
//! Lock methods return an [`Event`]: [`Event::NONE`] means the lock is held,
//! anything else means "wait for this, then call again".

use core::fmt;
use std::sync::Arc;

use crate::event::{Event, Events};
use crate::loom::hint;
use crate::loom::sync::atomic::{AtomicU64, Ordering::*};
use crate::loom::sync::Mutex;
use crate::rsrv::{AcquireKind, Mode, Reservation, Slot};
use crate::runtime::Node;

mycelium_bitfield::bitfield! {
    /// A snapshot of a [`FastReservation`]'s state word.
    #[derive(PartialEq, Eq)]
    pub(crate) struct FastState<u64> {
        /// Count of readers currently inside the lock.
        pub(crate) const READERS = 32;
        /// A writer holds the lock.
        pub(crate) const WRITER = 1;
        /// A writer is spinning for the lock; new readers should stand back.
        pub(crate) const WRITER_WAITING = 1;
        /// The base reservation currently owns the lock.
        pub(crate) const BASE_RSRV = 1;
        /// The base reservation has been asked for the lock back.
        pub(crate) const BASE_RSRV_WAITING = 1;
        /// At least one holder is sleeping while holding the lock.
        pub(crate) const SLEEPER = 1;
        /// Divert every operation through the base reservation.
        pub(crate) const SLOW_FALLBACK = 1;
    }
}

const READER_ONE: u64 = FastState::READERS.first_bit();
const READERS_MASK: u64 = FastState::READERS.raw_mask();
const WRITER: u64 = FastState::WRITER.raw_mask();
const WRITER_WAITING: u64 = FastState::WRITER_WAITING.raw_mask();
const BASE_RSRV: u64 = FastState::BASE_RSRV.raw_mask();
const BASE_RSRV_WAITING: u64 = FastState::BASE_RSRV_WAITING.raw_mask();
const SLEEPER: u64 = FastState::SLEEPER.raw_mask();
const SLOW_FALLBACK: u64 = FastState::SLOW_FALLBACK.raw_mask();

/// The nonblocking acquires used by fallback mode leave retry obligations on
/// the base reservation; this counter pairs each failed attempt with exactly
/// one later retry so the obligations drain to zero and the reservation
/// stays migratable.
static FALLBACK_RETRIES: portable_atomic::AtomicU32 = portable_atomic::AtomicU32::new(0);

/// How a caller of the `*lock` methods is prepared to wait.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WaitMode {
    /// Spin on ordinary contention; exceptional conditions hand back an
    /// event for the caller to wait on.
    Spin,
    /// Like [`WaitMode::Spin`], but without setting the writer-waiting
    /// reader throttle.
    Wait,
    /// Block the calling thread inside the lock call, through
    /// [`Events::block_on`]. For threads the runtime's scheduler does not
    /// manage.
    ExternalWait,
    /// Never wait on an event under any circumstances. Exceptional
    /// conditions are fatal.
    AlwaysSpin,
}

/// The atomic state word.
#[repr(transparent)]
struct StateCell(AtomicU64);

impl StateCell {
    #[cfg(not(loom))]
    const fn new(bits: u64) -> Self {
        Self(AtomicU64::new(bits))
    }

    #[cfg(loom)]
    fn new(bits: u64) -> Self {
        Self(AtomicU64::new(bits))
    }

    fn load(&self, order: core::sync::atomic::Ordering) -> u64 {
        self.0.load(order)
    }

    fn compare_exchange(&self, current: u64, new: u64) -> Result<u64, u64> {
        self.0.compare_exchange(current, new, AcqRel, Acquire)
    }

    fn fetch_add(&self, value: u64) -> u64 {
        self.0.fetch_add(value, AcqRel)
    }

    fn fetch_sub(&self, value: u64) -> u64 {
        self.0.fetch_sub(value, AcqRel)
    }

    fn fetch_and(&self, value: u64) -> u64 {
        self.0.fetch_and(value, AcqRel)
    }
}

impl fmt::Debug for StateCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&FastState::from_bits(self.load(Relaxed)), f)
    }
}

/// The base reservation underneath a [`FastReservation`].
struct BaseRsrv {
    node: Node,
    rsrv: Reservation,
    slot: Arc<Slot>,
}

/// State behind the private mutex: the pending base-reservation request and
/// the sleeper bookkeeping.
struct FastInner {
    /// Ready event of an outstanding base-reservation acquire, if any.
    rsrv_ready: Event,
    sleeper_count: u32,
    /// Merged guard event of every current sleeper.
    sleeper_event: Event,
}

/// A reader-writer lock whose fast paths are single atomic operations,
/// backed by a distributed [`Reservation`] for cross-node transitions.
///
/// Construct one with [`Node::fast_reservation`] to layer it over a base
/// reservation (honoring the node's fallback config), or with
/// [`FastReservation::new`] for a purely local lock with no base and no
/// event layer.
pub struct FastReservation {
    state: StateCell,
    base: Option<BaseRsrv>,
    events: Option<Arc<dyn Events>>,
    inner: Mutex<FastInner>,
}

impl FastReservation {
    /// Creates a fast reservation with no base reservation.
    ///
    /// Without an event layer, the lock supports the spin wait modes and
    /// single-sleeper sleep advice; operations that must create or merge
    /// events panic.
    #[must_use]
    pub fn new() -> Self {
        Self::build(0, None, None)
    }

    pub(crate) fn over_base(node: Node, base: Option<Reservation>) -> Self {
        let fallback = node.config().use_fast_reservation_fallback;
        let mut init = 0;
        if base.is_some() {
            // The base reservation owns the lock until somebody asks for it.
            init |= BASE_RSRV;
        }
        let base = base.or_else(|| fallback.then(|| node.create_reservation(0)));
        if fallback {
            init |= SLOW_FALLBACK;
        }
        let events = node.events().clone();
        let base = base.map(|rsrv| BaseRsrv {
            slot: node.slot(rsrv),
            rsrv,
            node: node.clone(),
        });
        Self::build(init, base, Some(events))
    }

    fn build(init: u64, base: Option<BaseRsrv>, events: Option<Arc<dyn Events>>) -> Self {
        Self {
            state: StateCell::new(init),
            base,
            events,
            inner: Mutex::new(FastInner {
                rsrv_ready: Event::NONE,
                sleeper_count: 0,
                sleeper_event: Event::NONE,
            }),
        }
    }

    fn events(&self) -> &Arc<dyn Events> {
        self.events
            .as_ref()
            .expect("this operation requires an event layer")
    }

    fn base(&self) -> &BaseRsrv {
        self.base
            .as_ref()
            .expect("this state requires a base reservation")
    }

    /// Acquires the write lock. Returns [`Event::NONE`] once the lock is
    /// held; any other event means "wait for this, then call again".
    pub fn wrlock(&self, mode: WaitMode) -> Event {
        // Fast path: nothing set but (possibly) the writer-waiting hint,
        // which the winning writer clears.
        let cur = self.state.load(Acquire);
        if cur & !WRITER_WAITING == 0 && self.state.compare_exchange(cur, WRITER).is_ok() {
            return Event::NONE;
        }
        self.wrlock_slow(mode)
    }

    /// Attempts the write lock without waiting.
    pub fn trywrlock(&self) -> bool {
        if self.state.compare_exchange(0, WRITER).is_ok() {
            return true;
        }
        self.trywrlock_slow()
    }

    /// Acquires the read lock. Returns [`Event::NONE`] once the lock is
    /// held; any other event means "wait for this, then call again".
    pub fn rdlock(&self, mode: WaitMode) -> Event {
        // Fast path: only readers (some possibly asleep) inside.
        let cur = self.state.load(Acquire);
        if cur & !(SLEEPER | READERS_MASK) == 0 {
            let prev = self.state.fetch_add(READER_ONE);
            if prev & !(SLEEPER | READERS_MASK) == 0 {
                return Event::NONE;
            }
            // Lost a race with an exceptional transition; back out.
            self.state.fetch_sub(READER_ONE);
        }
        self.rdlock_slow(mode)
    }

    /// Attempts the read lock without waiting.
    pub fn tryrdlock(&self) -> bool {
        let cur = self.state.load(Acquire);
        if cur & !(SLEEPER | READERS_MASK) == 0 {
            let prev = self.state.fetch_add(READER_ONE);
            if prev & !(SLEEPER | READERS_MASK) == 0 {
                return true;
            }
            let cur = self.state.fetch_sub(READER_ONE);
            // TODO: back out cleanly if BASE_RSRV_WAITING lands during the
            // erroneous reader-count bump instead of asserting.
            assert!(cur & BASE_RSRV_WAITING == 0);
            return false;
        }
        self.tryrdlock_slow()
    }

    /// Releases one read or write hold.
    pub fn unlock(&self) {
        let cur = self.state.load(Acquire);
        if cur & !(READERS_MASK | WRITER | WRITER_WAITING) == 0 {
            if cur & WRITER != 0 {
                if self.state.compare_exchange(cur, cur & !WRITER).is_ok() {
                    return;
                }
            } else if cur & READERS_MASK != 0
                && self.state.compare_exchange(cur, cur - READER_ONE).is_ok()
            {
                return;
            }
        }
        self.unlock_slow();
    }

    // WARNING: changes here need matching changes in trywrlock_slow below.
    fn wrlock_slow(&self, mode: WaitMode) -> Event {
        if self.state.load(Relaxed) & SLOW_FALLBACK != 0 {
            return self.fallback_acquire(Mode::new(0), true);
        }

        loop {
            let cur = self.state.load(Acquire);

            if cur & (SLOW_FALLBACK | BASE_RSRV | BASE_RSRV_WAITING | SLEEPER) == 0 {
                // No exceptional conditions: clear the waiting hint (if set)
                // and claim the write bit. The CAS fails while readers are
                // still inside.
                let prev = cur & WRITER_WAITING;
                if test_dbg!(self.state.compare_exchange(prev, WRITER)).is_ok() {
                    return Event::NONE;
                }

                if matches!(mode, WaitMode::Spin | WaitMode::AlwaysSpin) {
                    // Throttle new readers while we spin. This update is not
                    // atomic with the failed claim above, so only set the
                    // hint if the state has not moved; losing the race just
                    // costs another lap.
                    let _ = self.state.compare_exchange(cur, cur | WRITER_WAITING);
                    hint::spin_loop();
                    continue;
                }
            }

            // Exceptional transitions hold the private mutex so the flag
            // bits stay put while we classify them.
            let wait_for = {
                let mut fi = self.inner.lock();
                let cur = self.state.load(Acquire);
                if cur & BASE_RSRV != 0 {
                    self.request_base_rsrv(&mut fi)
                } else if cur & SLEEPER != 0 {
                    fi.sleeper_event
                } else if cur & !(READERS_MASK | WRITER | WRITER_WAITING) == 0 {
                    // Ordinary contention after all; go around again.
                    Event::NONE
                } else {
                    tracing::error!(state = ?FastState::from_bits(cur), "wrlock_slow: unexpected state");
                    panic!("wrlock_slow: unexpected state {:?}", FastState::from_bits(cur));
                }
            };

            if wait_for.exists() {
                match mode {
                    WaitMode::AlwaysSpin => {
                        panic!("always-spin callers cannot wait on {wait_for:?}")
                    }
                    WaitMode::Spin | WaitMode::Wait => return wait_for,
                    WaitMode::ExternalWait => self.events().block_on(wait_for),
                }
            } else {
                hint::spin_loop();
            }
        }
    }

    fn trywrlock_slow(&self) -> bool {
        if self.state.load(Relaxed) & SLOW_FALLBACK != 0 {
            return !self.fallback_acquire(Mode::new(0), true).exists();
        }

        loop {
            let cur = match test_dbg!(self.state.compare_exchange(0, WRITER)) {
                Ok(_) => return true,
                Err(cur) => cur,
            };

            // Simple contention just means failure.
            if cur & (READERS_MASK | WRITER | WRITER_WAITING) != 0 {
                return false;
            }

            let event_needed = {
                let mut fi = self.inner.lock();
                let cur = self.state.load(Acquire);
                if cur & BASE_RSRV != 0 {
                    self.request_base_rsrv(&mut fi).exists()
                } else if cur & SLEEPER != 0 {
                    true
                } else if cur & !(READERS_MASK | WRITER | WRITER_WAITING) == 0 {
                    false
                } else {
                    tracing::error!(state = ?FastState::from_bits(cur), "trywrlock_slow: unexpected state");
                    panic!("trywrlock_slow: unexpected state {:?}", FastState::from_bits(cur));
                }
            };

            // Anything that would require waiting fails the attempt.
            if event_needed {
                return false;
            }
        }
    }

    // WARNING: changes here need matching changes in tryrdlock_slow below.
    fn rdlock_slow(&self, mode: WaitMode) -> Event {
        if self.state.load(Relaxed) & SLOW_FALLBACK != 0 {
            return self.fallback_acquire(Mode::new(1), false);
        }

        loop {
            let cur = self.state.load(Acquire);

            // A sleeping reader is fine to share with; a sleeping writer is
            // not.
            let sleeping_writer = cur & (WRITER | SLEEPER) == (WRITER | SLEEPER);
            if cur & (SLOW_FALLBACK | BASE_RSRV | BASE_RSRV_WAITING) == 0 && !sleeping_writer {
                // Skip the count increment when a writer is present or
                // spinning, to avoid cache-fighting it.
                if cur & (WRITER | WRITER_WAITING) == 0 {
                    let prev = self.state.fetch_add(READER_ONE);
                    if prev & !(SLEEPER | READERS_MASK) == 0 {
                        return Event::NONE;
                    }
                    self.state.fetch_sub(READER_ONE);
                }

                if matches!(mode, WaitMode::Spin | WaitMode::AlwaysSpin) {
                    hint::spin_loop();
                    continue;
                }
            }

            let wait_for = {
                let mut fi = self.inner.lock();
                let cur = self.state.load(Acquire);
                if cur & BASE_RSRV != 0 {
                    self.request_base_rsrv(&mut fi)
                } else if cur & BASE_RSRV_WAITING != 0 {
                    // The remote side wants the lock back. If nobody is
                    // inside, hand the grant over now; normally unlock does
                    // this, but a reader that lost the race to the WAITING
                    // flag backs out its count and ends up here instead.
                    if cur & (WRITER | READERS_MASK) == 0 {
                        self.state.fetch_sub(BASE_RSRV_WAITING - BASE_RSRV);
                        self.base().slot.release();
                    }
                    // Either way, get back in line for the reservation and
                    // wait for that grant before trying the lock again.
                    self.request_base_rsrv(&mut fi)
                } else if cur & SLEEPER != 0 {
                    fi.sleeper_event
                } else if cur & !(READERS_MASK | WRITER | WRITER_WAITING) == 0 {
                    Event::NONE
                } else {
                    tracing::error!(state = ?FastState::from_bits(cur), "rdlock_slow: unexpected state");
                    panic!("rdlock_slow: unexpected state {:?}", FastState::from_bits(cur));
                }
            };

            if wait_for.exists() {
                match mode {
                    WaitMode::AlwaysSpin => {
                        panic!("always-spin callers cannot wait on {wait_for:?}")
                    }
                    WaitMode::Spin | WaitMode::Wait => return wait_for,
                    WaitMode::ExternalWait => self.events().block_on(wait_for),
                }
            } else {
                hint::spin_loop();
            }
        }
    }

    fn tryrdlock_slow(&self) -> bool {
        if self.state.load(Relaxed) & SLOW_FALLBACK != 0 {
            return !self.fallback_acquire(Mode::new(1), false).exists();
        }

        loop {
            let cur = self.state.load(Acquire);

            if cur & !(SLEEPER | READERS_MASK) == 0 {
                let prev = self.state.fetch_add(READER_ONE);
                if prev & !(SLEEPER | READERS_MASK) == 0 {
                    return true;
                }
                let cur = self.state.fetch_sub(READER_ONE);
                assert!(cur & BASE_RSRV_WAITING == 0);
                return false;
            }

            // If the base reservation appears to own the lock, asking for it
            // might succeed immediately; anything else fails the attempt.
            if cur & BASE_RSRV != 0 {
                let retry = {
                    let mut fi = self.inner.lock();
                    let cur = self.state.load(Acquire);
                    cur & BASE_RSRV != 0 && !self.request_base_rsrv(&mut fi).exists()
                };
                if retry {
                    continue;
                }
            }

            return false;
        }
    }

    fn unlock_slow(&self) {
        if self.state.load(Relaxed) & SLOW_FALLBACK != 0 {
            self.base().slot.release();
            return;
        }

        // The fast path already failed; hold the mutex so the exceptional
        // bits stay put while we undo the hold.
        let fi = self.inner.lock();

        let cur = self.state.load(Acquire);
        if cur & WRITER != 0 {
            assert!(cur & (SLEEPER | BASE_RSRV) == 0);

            if cur & BASE_RSRV_WAITING != 0 {
                // Swap WAITING for the base owning the lock again, and hand
                // the grant back.
                self.state.fetch_sub(BASE_RSRV_WAITING - BASE_RSRV);
                self.base().slot.release();
            }

            self.state.fetch_sub(WRITER);
        } else {
            let readers = cur & READERS_MASK;
            assert!(readers > 0, "unlock of an unheld fast reservation");
            assert!(cur & BASE_RSRV == 0);
            assert!(readers > READER_ONE || cur & SLEEPER == 0);

            if cur & BASE_RSRV_WAITING != 0 && readers == READER_ONE {
                self.state.fetch_sub(BASE_RSRV_WAITING - BASE_RSRV);
                self.base().slot.release();
            }

            self.state.fetch_sub(READER_ONE);
        }

        drop(fi);
    }

    /// Issues (or reuses) an acquire of the base reservation, and clears the
    /// `BASE_RSRV` bit once the grant is in hand. Must be called with the
    /// private mutex held.
    fn request_base_rsrv(&self, fi: &mut FastInner) -> Event {
        if !fi.rsrv_ready.exists() {
            fi.rsrv_ready =
                self.base()
                    .slot
                    .acquire(Mode::new(0), true, AcquireKind::Blocking, Event::NONE);
        }

        // The grant may have been immediate, or an earlier request may have
        // been satisfied since we last looked.
        if self.events().poll(fi.rsrv_ready).has_triggered() {
            fi.rsrv_ready = Event::NONE;
            let prev = self.state.fetch_sub(BASE_RSRV);
            debug_assert!(prev & BASE_RSRV != 0);
            return Event::NONE;
        }

        fi.rsrv_ready
    }

    fn fallback_acquire(&self, mode: Mode, exclusive: bool) -> Event {
        // Choose a retry attempt whenever earlier failed attempts are still
        // owed one, so the base reservation's retry obligations drain.
        let mut current = FALLBACK_RETRIES.load(Relaxed);
        let kind = loop {
            if current == 0 {
                break AcquireKind::Nonblocking;
            }
            match FALLBACK_RETRIES.compare_exchange_weak(current, current - 1, Relaxed, Relaxed) {
                Ok(_) => break AcquireKind::NonblockingRetry,
                Err(seen) => current = seen,
            }
        };

        let event = self
            .base()
            .slot
            .acquire(mode, exclusive, kind, Event::NONE);
        if event.exists() {
            // The attempt failed and will be retried later.
            FALLBACK_RETRIES.fetch_add(1, Relaxed);
        }
        event
    }

    /// Tells the lock that the caller, who holds it, is about to block
    /// elsewhere until `guard_event` triggers. Slow-path waiters will wait
    /// on the (merged) guard event of all current sleepers instead of
    /// spinning.
    pub fn advise_sleep_entry(&self, guard_event: Event) {
        let mut fi = self.inner.lock();
        if fi.sleeper_count == 0 {
            assert!(!fi.sleeper_event.exists());
            fi.sleeper_event = guard_event;
            let prev = self.state.fetch_add(SLEEPER);
            assert!(prev & SLEEPER == 0);
            // A spinning writer that goes to sleep must stop throttling
            // readers.
            if prev & WRITER_WAITING != 0 {
                self.state.fetch_and(!WRITER_WAITING);
            }
            fi.sleeper_count = 1;
        } else {
            assert!(fi.sleeper_event.exists());
            debug_assert!(self.state.load(Relaxed) & SLEEPER != 0);
            debug_assert!(self.state.load(Relaxed) & WRITER_WAITING == 0);
            fi.sleeper_count += 1;
            if guard_event != fi.sleeper_event {
                fi.sleeper_event = self.events().merge(&[fi.sleeper_event, guard_event]);
            }
        }
    }

    /// Undoes one [`advise_sleep_entry`](Self::advise_sleep_entry).
    pub fn advise_sleep_exit(&self) {
        let mut fi = self.inner.lock();
        assert!(fi.sleeper_count > 0);
        if fi.sleeper_count == 1 {
            let prev = self.state.fetch_sub(SLEEPER);
            assert!(prev & SLEEPER != 0);
            debug_assert!(prev & WRITER_WAITING == 0);
            fi.sleeper_count = 0;
            assert!(fi.sleeper_event.exists());
            fi.sleeper_event = Event::NONE;
        } else {
            assert!(fi.sleeper_event.exists());
            debug_assert!(self.state.load(Relaxed) & SLEEPER != 0);
            fi.sleeper_count -= 1;
        }
    }
}

impl Default for FastReservation {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FastReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FastReservation")
            .field("state", &self.state)
            .field("base", &self.base.as_ref().map(|b| b.rsrv))
            .finish_non_exhaustive()
    }
}

impl Drop for FastReservation {
    fn drop(&mut self) {
        // If the base reservation exists and does not hold the lock right
        // now, give it back; a fallback-mode lock owns its reservation
        // outright and destroys it instead.
        if let Some(base) = self.base.as_ref() {
            let state = self.state.load(Relaxed);
            if state & BASE_RSRV == 0 {
                if state & SLOW_FALLBACK != 0 {
                    base.node.destroy_reservation(base.rsrv, Event::NONE);
                } else {
                    base.slot.release();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
