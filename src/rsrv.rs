//! Reservation handles and the per-slot lock state machine.
//!
//! A [`Reservation`] is a small `Copy` handle naming one distributed lock.
//! Every node that touches a reservation holds a *slot* for it: the slot
//! tracks which node currently owns the right to grant the lock, how many
//! grants are outstanding locally, and who is waiting. All transitions on a
//! slot are serialized by the slot's mutex; messages and event triggers are
//! always issued after the mutex is dropped, because the incoming message
//! path and woken waiters both reenter the slot.
//!
//! Ownership begins at the creator node and migrates with exclusive grants:
//! when the owner releases its last grant and only remote nodes are waiting,
//! it picks the lowest-numbered waiter, appoints it the new owner, and ships
//! it the remaining waiter mask along with the reservation's opaque payload.

use core::fmt;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use mycelium_bitfield::Pack64;

use crate::event::Event;
use crate::loom::sync::Mutex;
use crate::net::{decode_grant_payload, encode_grant_payload, Message, NodeId, NodeSet};
use crate::runtime::Shared;

/// An access mode for a [`Reservation`].
///
/// Modes form a flat integer space: two acquires in the same non-exclusive
/// mode may share the lock, and lower-numbered modes have higher priority
/// when the lock is handed to waiters. The reserved [`Mode::EXCL`] sentinel
/// forbids all sharing and outranks every numbered mode.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mode(u32);

impl Mode {
    /// The exclusive mode. Never shared, and always first in line.
    pub const EXCL: Self = Self(u32::MAX);

    /// Returns the shared mode numbered `mode`.
    ///
    /// # Panics
    ///
    /// If `mode` is the reserved exclusive sentinel (`u32::MAX`); use
    /// [`Mode::EXCL`] (or the `exclusive` flag on acquire) for that.
    #[must_use]
    pub const fn new(mode: u32) -> Self {
        assert!(mode != u32::MAX, "u32::MAX is reserved for Mode::EXCL");
        Self(mode)
    }

    /// Returns the raw mode number.
    #[must_use]
    pub const fn into_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::EXCL {
            f.write_str("EXCL")
        } else {
            write!(f, "mode{}", self.0)
        }
    }
}

/// A handle to a distributed reservation.
///
/// Handles are minted by [`Node::create_reservation`] and stay valid until
/// [`Node::destroy_reservation`]; they can be copied freely and shipped to
/// other nodes (they are just packed integers). The distinguished
/// [`Reservation::NIL`] handle names no reservation, compares equal only to
/// itself, and is never acquirable.
///
/// [`Node::create_reservation`]: crate::runtime::Node::create_reservation
/// [`Node::destroy_reservation`]: crate::runtime::Node::destroy_reservation
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reservation(u64);

impl Reservation {
    const INDEX: Pack64 = Pack64::least_significant(32);
    const CREATOR: Pack64 = Self::INDEX.next(16);
    // Keeps every real handle distinct from the all-zero NIL word.
    const TAG: Pack64 = Self::CREATOR.next(1);

    /// The null reservation.
    pub const NIL: Self = Self(0);

    pub(crate) fn from_parts(creator: NodeId, index: u32) -> Self {
        let mut bits = Self::INDEX.pack_truncating(index as u64, 0);
        bits = Self::CREATOR.pack_truncating(creator.into_raw() as u64, bits);
        bits = Self::TAG.pack_truncating(1, bits);
        Self(bits)
    }

    /// Returns `true` if this is a real handle rather than
    /// [`Reservation::NIL`].
    #[must_use]
    pub fn exists(&self) -> bool {
        *self != Self::NIL
    }

    /// The node this reservation was created on. Destruction must happen
    /// there, and a node with no better information assumes the creator
    /// still owns the lock.
    #[must_use]
    pub fn creator(&self) -> NodeId {
        NodeId::new(Self::CREATOR.unpack_bits(self.0) as u16)
    }

    pub(crate) fn index(&self) -> u32 {
        Self::INDEX.unpack_bits(self.0) as u32
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exists() {
            write!(f, "rsrv:{}.{}", self.creator(), self.index())
        } else {
            f.write_str("rsrv:NIL")
        }
    }
}

impl fmt::Display for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How hard an acquire is willing to try.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum AcquireKind {
    /// Wait as long as needed; failure queues a grant event.
    Blocking,
    /// First attempt of a try-acquire; failure records a retry obligation
    /// and hands back the mode's shared retry event.
    Nonblocking,
    /// A later attempt by a waiter whose earlier try failed; success pays
    /// down the retry obligation.
    NonblockingRetry,
    /// Records the retry obligation without attempting anything; used while
    /// a try-acquire's precondition event is still pending.
    NonblockingPlaceholder,
}

/// `count` is stored biased so a free reservation reads as `ZERO_COUNT`
/// rather than numeric zero, which keeps accidental underflow (and stale
/// zero-initialized memory) visibly distinct in debug output.
pub(crate) const ZERO_COUNT: u32 = 50;

/// One node's slot for a reservation.
pub(crate) struct Slot {
    me: Reservation,
    shared: Arc<Shared>,
    inner: Mutex<SlotInner>,
}

struct SlotInner {
    /// The node currently allowed to grant this lock.
    owner: NodeId,
    /// Current access mode; meaningful only while `count > ZERO_COUNT`.
    mode: Mode,
    /// Number of outstanding grants, biased by [`ZERO_COUNT`].
    count: u32,
    /// Set between create and destroy; only meaningful on the creator.
    in_use: bool,
    /// A request is in flight to `owner` and has not been granted yet.
    requested: bool,
    /// Pending blocking acquires, per mode, in arrival order.
    local_waiters: BTreeMap<Mode, VecDeque<Event>>,
    /// One shared retry event per mode with failed try-acquires.
    retry_events: BTreeMap<Mode, Event>,
    /// Outstanding try-acquire retry obligations per mode. The lock may not
    /// migrate to another node while any are pending.
    retry_count: BTreeMap<Mode, u32>,
    /// Remote nodes waiting for a grant; non-empty only on the owner.
    remote_waiter_mask: NodeSet,
    /// Remote nodes currently sharing the lock.
    remote_sharer_mask: NodeSet,
    /// Opaque payload that travels with the lock; the owner's copy is the
    /// valid one.
    local_data: Vec<u8>,
}

impl SlotInner {
    fn new(owner: NodeId) -> Self {
        Self {
            owner,
            mode: Mode::EXCL,
            count: ZERO_COUNT,
            in_use: false,
            requested: false,
            local_waiters: BTreeMap::new(),
            retry_events: BTreeMap::new(),
            retry_count: BTreeMap::new(),
            remote_waiter_mask: NodeSet::new(),
            remote_sharer_mask: NodeSet::new(),
            local_data: Vec::new(),
        }
    }

    /// Picks the next local grant recipients, filling `to_wake` with the
    /// events to trigger (after the mutex is dropped!) and updating
    /// `mode`/`count` accordingly. Returns `false` if nobody local is
    /// waiting.
    ///
    /// Exclusive waiters always go first — blocking ones, then exclusive
    /// retriers. After that, the lowest-numbered blocking mode is drained
    /// wholesale unless an even lower-numbered retry event outranks it, in
    /// which case one retry event is popped (waking every try-acquirer
    /// sharing it) and the lock is left free for their retries. `EXCL`
    /// sorts *last* numerically, so both maps special-case it rather than
    /// trusting key order.
    fn select_local_waiters(&mut self, to_wake: &mut Vec<Event>) -> bool {
        if self.local_waiters.is_empty() && self.retry_events.is_empty() {
            return false;
        }

        if let Some(mut excl_waiters) = self.local_waiters.remove(&Mode::EXCL) {
            let front = excl_waiters
                .pop_front()
                .expect("empty waiter lists are never stored");
            to_wake.push(front);
            if !excl_waiters.is_empty() {
                self.local_waiters.insert(Mode::EXCL, excl_waiters);
            }
            self.mode = Mode::EXCL;
            self.count = ZERO_COUNT + 1;
        } else if let Some(event) = self.retry_events.remove(&Mode::EXCL) {
            // A failed exclusive try outranks shared waiters just like a
            // blocking exclusive acquire does; wake its retriers and leave
            // the lock free for them.
            to_wake.push(event);
        } else {
            let retry_mode = self.retry_events.keys().next().copied();
            let blocking_mode = self.local_waiters.keys().next().copied();
            match (blocking_mode, retry_mode) {
                (Some(b), r) if r.map_or(true, |r| b <= r) => {
                    let (mode, waiters) = self
                        .local_waiters
                        .pop_first()
                        .expect("checked non-empty above");
                    self.mode = mode;
                    self.count = ZERO_COUNT + waiters.len() as u32;
                    to_wake.extend(waiters);
                    // TODO(dist-sharing): co-sharing with remote waiters in
                    // the same mode would go here; grants to remote nodes are
                    // exclusive-only for now.
                }
                _ => {
                    let (_, event) = self
                        .retry_events
                        .pop_first()
                        .expect("checked non-empty above");
                    to_wake.push(event);
                }
            }
        }

        true
    }
}

impl Slot {
    pub(crate) fn new(me: Reservation, owner: NodeId, shared: Arc<Shared>) -> Self {
        Self {
            me,
            shared,
            inner: Mutex::new(SlotInner::new(owner)),
        }
    }

    pub(crate) fn me(&self) -> Reservation {
        self.me
    }

    /// Marks a recycled creator-side slot live again and sizes its payload.
    pub(crate) fn activate(&self, data_size: usize) {
        let mut s = self.inner.lock();
        assert_eq!(s.owner, self.shared.id);
        assert_eq!(s.count, ZERO_COUNT);
        assert_eq!(s.mode, Mode::EXCL);
        assert!(s.local_waiters.is_empty());
        assert!(s.remote_waiter_mask.is_empty());
        assert!(!s.in_use);
        s.in_use = true;
        s.local_data = vec![0; data_size];
    }

    /// Tears a creator-side slot down for recycling. The caller must hold
    /// the reservation exclusively.
    pub(crate) fn retire(&self) {
        let mut s = self.inner.lock();
        assert_eq!(s.owner, self.shared.id);
        assert_eq!(s.count, ZERO_COUNT + 1);
        assert_eq!(s.mode, Mode::EXCL);
        assert!(s.local_waiters.is_empty());
        assert!(s.remote_waiter_mask.is_empty());
        assert!(s.in_use);
        s.local_data = Vec::new();
        s.in_use = false;
        s.count = ZERO_COUNT;
    }

    /// The slot-level acquire path. Returns [`Event::NONE`] if the grant
    /// happened (or, for a placeholder, once the obligation is recorded);
    /// otherwise returns the event that will trigger when this caller should
    /// proceed (a grant event for blocking acquires, the mode's retry event
    /// for nonblocking ones).
    pub(crate) fn acquire(
        &self,
        new_mode: Mode,
        exclusive: bool,
        kind: AcquireKind,
        mut after_lock: Event,
    ) -> Event {
        // Exclusivity is just the reserved mode.
        let new_mode = if exclusive { Mode::EXCL } else { new_mode };

        tracing::debug!(
            rsrv = %self.me,
            mode = ?new_mode,
            ?kind,
            event = ?after_lock,
            "reservation acquire",
        );

        let mut got_lock = false;
        let mut request_target = None;
        let mut bonus_grants: Vec<Event> = Vec::new();

        {
            let mut s = self.inner.lock();

            // Acquiring a handle after its destruction is a caller bug; the
            // slot's liveness is only tracked on its home node.
            assert!(
                self.me.creator() != self.shared.id || s.in_use,
                "acquire of destroyed reservation {}",
                self.me,
            );

            if kind == AcquireKind::NonblockingPlaceholder {
                *s.retry_count.entry(new_mode).or_insert(0) += 1;
                return Event::NONE;
            }

            if s.owner == self.shared.id {
                // We own the lock. Grant if it is free, or if the requested
                // shared mode matches the current one and no waiter of
                // higher priority (EXCL, or a lower-numbered mode) is ahead.
                let shareable = s.mode == new_mode
                    && new_mode != Mode::EXCL
                    && !s.local_waiters.contains_key(&Mode::EXCL)
                    && s.local_waiters
                        .keys()
                        .next()
                        .map_or(true, |&first| first > new_mode);
                if s.count == ZERO_COUNT || shareable {
                    s.mode = new_mode;
                    s.count += 1;
                    got_lock = true;
                    // A shared grant can take queued waiters and pending
                    // retriers of the same mode along for the ride. Woken
                    // blocking waiters hold the lock and count toward it;
                    // woken retriers only get another attempt.
                    if new_mode != Mode::EXCL {
                        if let Some(waiters) = s.local_waiters.remove(&new_mode) {
                            s.count += waiters.len() as u32;
                            bonus_grants.extend(waiters);
                        }
                        if let Some(retry) = s.retry_events.remove(&new_mode) {
                            bonus_grants.push(retry);
                        }
                    }
                }
            } else {
                // Somebody else owns it. We may still join sharers we
                // already host in the same mode.
                if s.count > ZERO_COUNT && s.mode == new_mode {
                    debug_assert!(new_mode != Mode::EXCL);
                    s.count += 1;
                    got_lock = true;
                }

                // Otherwise ask the owner, unless a request is already in
                // flight. The message itself goes out after the mutex drops:
                // the incoming handler path takes this same mutex.
                if !got_lock && !s.requested {
                    request_target = Some(s.owner);
                    s.requested = true;
                }
            }

            tracing::debug!(
                rsrv = %self.me,
                got = got_lock,
                requested = s.requested,
                count = s.count - ZERO_COUNT,
                "reservation acquire result",
            );

            // A successful retry pays down the obligation recorded by the
            // failed attempt (or its placeholder).
            if got_lock && kind == AcquireKind::NonblockingRetry {
                match s.retry_count.get_mut(&new_mode) {
                    Some(n) if *n > 1 => *n -= 1,
                    Some(_) => {
                        s.retry_count.remove(&new_mode);
                    }
                    None => panic!(
                        "retry acquire of {} in {:?} with no outstanding obligation",
                        self.me, new_mode,
                    ),
                }
            }

            if !got_lock {
                match kind {
                    AcquireKind::Blocking => {
                        if !after_lock.exists() {
                            after_lock = self.shared.events.create();
                        }
                        s.local_waiters
                            .entry(new_mode)
                            .or_default()
                            .push_back(after_lock);
                    }
                    AcquireKind::Nonblocking | AcquireKind::NonblockingRetry => {
                        if kind == AcquireKind::Nonblocking {
                            *s.retry_count.entry(new_mode).or_insert(0) += 1;
                        }
                        assert!(
                            !after_lock.exists(),
                            "try-acquires cannot supply their own grant event",
                        );
                        // All failed tries of one mode share a single retry
                        // event.
                        after_lock = match s.retry_events.get(&new_mode) {
                            Some(&event) => event,
                            None => {
                                let event = self.shared.events.create();
                                s.retry_events.insert(new_mode, event);
                                event
                            }
                        };
                    }
                    AcquireKind::NonblockingPlaceholder => unreachable!("returned above"),
                }
            }
        }

        if let Some(owner) = request_target {
            tracing::debug!(rsrv = %self.me, %owner, mode = ?new_mode, "requesting reservation");
            self.shared.network.send(
                owner,
                Message::Request {
                    requester: self.shared.id,
                    rsrv: self.me,
                    mode: new_mode,
                },
            );
        }

        if got_lock && after_lock.exists() {
            self.shared.events.trigger(after_lock, false);
        }

        for event in bonus_grants {
            tracing::debug!(rsrv = %self.me, ?event, "acquire bonus grant");
            self.shared.events.trigger(event, false);
        }

        after_lock
    }

    /// The slot-level release path.
    pub(crate) fn release(&self) {
        // Everything to wake or send is collected under the mutex and issued
        // after it drops; a triggered waiter may immediately reenter this
        // slot.
        let mut to_wake = Vec::new();
        let mut release_target = None;
        let mut grant = None;

        {
            let mut s = self.inner.lock();

            tracing::debug!(
                rsrv = %self.me,
                count = s.count - ZERO_COUNT,
                mode = ?s.mode,
                owner = %s.owner,
                "release",
            );
            assert!(s.count > ZERO_COUNT);

            s.count -= 1;
            if s.count == ZERO_COUNT {
                if s.owner != self.shared.id {
                    // We were sharing somebody else's lock; tell them we're
                    // done.
                    assert!(s.mode != Mode::EXCL);
                    s.mode = Mode::new(0);
                    release_target = Some(s.owner);
                } else if s.select_local_waiters(&mut to_wake) {
                    debug_assert!(!to_wake.is_empty());
                } else if !s.remote_waiter_mask.is_empty() && s.retry_count.is_empty() {
                    // Nobody local wants it, another node does, and no
                    // try-acquirer still has a retry coming: migrate.
                    let new_owner = s
                        .remote_waiter_mask
                        .first()
                        .expect("checked non-empty above");
                    s.remote_waiter_mask.remove(new_owner);
                    tracing::debug!(rsrv = %self.me, %new_owner, "reservation going to remote waiter");
                    let payload = encode_grant_payload(&s.remote_waiter_mask, &s.local_data);
                    s.owner = new_owner;
                    s.remote_waiter_mask = NodeSet::new();
                    grant = Some((new_owner, payload));
                } else {
                    // Nobody can take it right now; it sits idle. Remote
                    // waiters (if any) stay parked until pending retries
                    // drain.
                    debug_assert!(s.local_waiters.is_empty());
                    debug_assert!(s.retry_events.is_empty());
                }
            }
        }

        if let Some(owner) = release_target {
            tracing::debug!(rsrv = %self.me, %owner, "releasing reservation back to owner");
            self.shared
                .network
                .send(owner, Message::Release { rsrv: self.me });
        }

        if let Some((new_owner, payload)) = grant {
            self.shared.network.send(
                new_owner,
                Message::Grant {
                    rsrv: self.me,
                    mode: Mode::EXCL,
                    payload,
                },
            );
        }

        for event in to_wake {
            tracing::debug!(rsrv = %self.me, ?event, "release trigger");
            self.shared.events.trigger(event, false);
        }
    }

    /// Conservatively reports whether this node holds the lock in
    /// `check_mode` (or exclusively, if `excl_ok`).
    pub(crate) fn is_locked(&self, check_mode: Mode, excl_ok: bool) -> bool {
        let s = self.inner.lock();
        s.owner == self.shared.id
            && s.count > ZERO_COUNT
            && (s.mode == check_mode || (s.mode == Mode::EXCL && excl_ok))
    }

    /// Handles an incoming [`Message::Request`].
    pub(crate) fn handle_request(&self, requester: NodeId, mode: Mode) {
        tracing::debug!(rsrv = %self.me, %requester, ?mode, "reservation request");

        let mut forward_to = None;
        let mut grant = None;

        {
            let mut s = self.inner.lock();

            if s.owner != self.shared.id {
                // We don't own it any more; pass the request along to
                // whoever we think does.
                tracing::debug!(
                    rsrv = %self.me,
                    %requester,
                    to = %s.owner,
                    "forwarding reservation request",
                );
                forward_to = Some(s.owner);
            } else {
                assert!(
                    self.me.creator() != self.shared.id || s.in_use,
                    "request for destroyed reservation {}",
                    self.me,
                );

                if s.count == ZERO_COUNT
                    && s.remote_sharer_mask.is_empty()
                    && s.retry_count.is_empty()
                {
                    debug_assert!(s.remote_waiter_mask.is_empty());
                    tracing::debug!(rsrv = %self.me, %requester, ?mode, "granting reservation request");
                    let payload = encode_grant_payload(&s.remote_waiter_mask, &s.local_data);
                    s.owner = requester;
                    s.remote_waiter_mask = NodeSet::new();
                    grant = Some(payload);
                } else {
                    // Can't grant right now; park the requester in the
                    // waiter mask and get back to work.
                    tracing::debug!(
                        rsrv = %self.me,
                        %requester,
                        ?mode,
                        count = s.count - ZERO_COUNT,
                        "deferring reservation request",
                    );
                    s.remote_waiter_mask.add(requester);
                }
            }
        }

        if let Some(owner) = forward_to {
            self.shared.network.send(
                owner,
                Message::Request {
                    requester,
                    rsrv: self.me,
                    mode,
                },
            );
        }

        if let Some(payload) = grant {
            self.shared.network.send(
                requester,
                Message::Grant {
                    rsrv: self.me,
                    mode: Mode::EXCL,
                    payload,
                },
            );
        }
    }

    /// Handles an incoming [`Message::Grant`]: we asked for the lock, and
    /// here it is. The waiter mask and payload move with it, ownership
    /// transfers on an exclusive grant, and at least one local waiter must
    /// be ready to take the grant (a request is only ever sent on a
    /// waiter's behalf).
    pub(crate) fn handle_grant(&self, mode: Mode, payload: &[u8]) {
        tracing::debug!(rsrv = %self.me, ?mode, "reservation request granted");

        let mut to_wake = Vec::new();

        {
            let mut s = self.inner.lock();

            assert!(s.owner != self.shared.id);
            assert!(s.requested);

            let (waiters, data) = decode_grant_payload(payload);
            s.remote_waiter_mask = waiters;
            s.local_data = data.to_vec();

            if mode == Mode::EXCL {
                s.owner = self.shared.id;
            }
            s.mode = mode;
            s.requested = false;

            let any_local = s.select_local_waiters(&mut to_wake);
            assert!(
                any_local,
                "grant of {} arrived with no local waiters",
                self.me,
            );
        }

        for event in to_wake {
            tracing::debug!(rsrv = %self.me, ?event, "grant trigger");
            self.shared.events.trigger(event, false);
        }
    }

    /// Handles an incoming [`Message::Release`]: a remote sharer has dropped
    /// its last grant, so the owner's count comes down exactly as for a
    /// local release.
    pub(crate) fn handle_release(&self, from: NodeId) {
        {
            let mut s = self.inner.lock();
            s.remote_sharer_mask.remove(from);
        }
        self.release();
    }
}

#[cfg(all(test, not(loom)))]
mod tests;
