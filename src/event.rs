//! The contract between this crate and the event subsystem.
//!
//! Reservations never block their caller: an operation whose outcome is not
//! immediately known hands back an [`Event`], and the caller waits on that
//! event through whatever event subsystem the containing runtime provides.
//! This module defines the seam: an event is an opaque [`Copy`] handle, and
//! the subsystem behind it is reached through the [`Events`] trait.
//!
//! Events are stored by value everywhere in this crate. The event layer owns
//! the waiter lists, so no reference cycles can form between waiters and the
//! objects they wait on.

use core::fmt;

/// An opaque handle to an event owned by the runtime's event subsystem.
///
/// The distinguished [`Event::NONE`] handle names the event that has always
/// already triggered; it is returned by operations that complete immediately.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Event(u64);

impl Event {
    /// The no-op event. It has always triggered, and triggering it again is
    /// never legal.
    pub const NONE: Self = Self(0);

    /// Returns `true` if this is a real event rather than [`Event::NONE`].
    #[inline]
    #[must_use]
    pub fn exists(&self) -> bool {
        self.0 != 0
    }

    /// Constructs an event handle from the raw identifier minted by an event
    /// layer. Zero is reserved for [`Event::NONE`].
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier backing this handle.
    #[must_use]
    pub const fn into_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exists() {
            write!(f, "Event({})", self.0)
        } else {
            f.write_str("Event(NONE)")
        }
    }
}

/// The observable state of an event at a point in time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventPoll {
    /// The event has not triggered yet.
    Pending,
    /// The event has triggered.
    Triggered,
    /// The event has triggered in a failure state; waiters should propagate
    /// the failure rather than act.
    Poisoned,
}

impl EventPoll {
    /// Returns `true` for either flavor of triggered.
    #[inline]
    #[must_use]
    pub fn has_triggered(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A one-shot callback fired when an event triggers.
///
/// Waiters consume themselves when fired; the `poisoned` flag carries the
/// triggering event's failure state.
pub trait EventWaiter: Send {
    /// Called by the event layer exactly once, after the subscribed event
    /// triggers.
    fn event_triggered(self: Box<Self>, poisoned: bool);
}

/// The operations this crate requires of the runtime's event subsystem.
///
/// Implementations must uphold:
///
/// - [`Event::NONE`] polls as [`EventPoll::Triggered`].
/// - A given event triggers at most once.
/// - Waiters registered through [`add_waiter`] fire exactly once, and are
///   *not* fired while any lock internal to the event layer is held (a waiter
///   may reenter the event layer or take reservation mutexes).
///
/// [`add_waiter`]: Events::add_waiter
pub trait Events: Send + Sync {
    /// Mints a fresh, untriggered event.
    fn create(&self) -> Event;

    /// Reports the current state of `event`.
    fn poll(&self, event: Event) -> EventPoll;

    /// Triggers `event`, waking waiters. `poisoned` marks the trigger as a
    /// failure that waiters must propagate instead of acting on.
    fn trigger(&self, event: Event, poisoned: bool);

    /// Returns an event that triggers once every event in `events` has
    /// triggered. Poison propagates: if any input triggers poisoned, the
    /// merged event triggers poisoned. May return [`Event::NONE`] if every
    /// input has already triggered cleanly.
    fn merge(&self, events: &[Event]) -> Event;

    /// Registers `waiter` to fire when `event` triggers. If `event` has
    /// already triggered, the waiter fires before this call returns.
    fn add_waiter(&self, event: Event, waiter: Box<dyn EventWaiter>);

    /// Blocks the calling thread until `event` triggers. Only used by
    /// [`WaitMode::ExternalWait`](crate::fast::WaitMode::ExternalWait)
    /// callers, which are by definition threads the runtime's scheduler does
    /// not manage.
    fn block_on(&self, event: Event);
}
