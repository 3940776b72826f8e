use std::sync::Arc;

use super::*;
use crate::event::{EventPoll, Events};
use crate::runtime::Node;
use crate::sim::{Loopback, SimEvents};

fn sim_node() -> (Arc<SimEvents>, Loopback, Node) {
    let events = Arc::new(SimEvents::new());
    let net = Loopback::new();
    let node = net.join(NodeId::new(0), events.clone());
    (events, net, node)
}

fn with_state<R>(node: &Node, rsrv: Reservation, f: impl FnOnce(&mut SlotInner) -> R) -> R {
    let slot = node.slot(rsrv);
    let mut s = slot.inner.lock();
    // Universal invariants, checked on every peek.
    assert!(s.count >= ZERO_COUNT);
    if s.count > ZERO_COUNT && s.mode == Mode::EXCL {
        assert_eq!(s.count, ZERO_COUNT + 1);
    }
    f(&mut s)
}

#[test]
fn handle_packing() {
    let rsrv = Reservation::from_parts(NodeId::new(7), 42);
    assert!(rsrv.exists());
    assert_eq!(rsrv.creator(), NodeId::new(7));
    assert_eq!(rsrv.index(), 42);
    assert_ne!(Reservation::from_parts(NodeId::new(0), 0), Reservation::NIL);
    assert!(!Reservation::NIL.exists());
}

#[test]
fn lone_exclusive() {
    let _trace = crate::util::test::trace_init();
    let (events, net, node) = sim_node();

    let rsrv = node.create_reservation(0);
    let grant = node.acquire(rsrv, Mode::new(0), true, Event::NONE);
    assert!(!grant.exists(), "uncontended exclusive acquire is immediate");
    with_state(&node, rsrv, |s| {
        assert_eq!(s.owner, node.id());
        assert_eq!(s.mode, Mode::EXCL);
        assert_eq!(s.count, ZERO_COUNT + 1);
    });
    assert!(node.is_locked(rsrv, Mode::new(0), true));

    node.release(rsrv, Event::NONE);
    with_state(&node, rsrv, |s| {
        assert_eq!(s.owner, node.id());
        assert_eq!(s.count, ZERO_COUNT);
    });
    assert!(!node.is_locked(rsrv, Mode::new(0), true));
    assert_eq!(net.pending(), 0, "nothing crossed the wire");
    assert_eq!(events.poll(grant), EventPoll::Triggered);
}

#[test]
fn shared_mode_never_blocks_matching_holders() {
    let _trace = crate::util::test::trace_init();
    let (_events, _net, node) = sim_node();

    let rsrv = node.create_reservation(0);
    for n in 1..=3u32 {
        let grant = node.acquire(rsrv, Mode::new(3), false, Event::NONE);
        assert!(!grant.exists());
        with_state(&node, rsrv, |s| {
            assert_eq!(s.mode, Mode::new(3));
            assert_eq!(s.count, ZERO_COUNT + n);
        });
    }
    for _ in 0..3 {
        node.release(rsrv, Event::NONE);
    }
    with_state(&node, rsrv, |s| assert_eq!(s.count, ZERO_COUNT));
}

#[test]
fn shared_bonus_grant() {
    let _trace = crate::util::test::trace_init();
    let (events, _net, node) = sim_node();
    let rsrv = node.create_reservation(0);

    // Hold exclusively, then line up a blocking waiter in mode 3 and a
    // failed try in mode 0.
    let held = node.acquire(rsrv, Mode::new(0), true, Event::NONE);
    assert!(!held.exists());
    let e_blocked = node.acquire(rsrv, Mode::new(3), false, Event::NONE);
    assert!(e_blocked.exists());
    let e_retry = node.try_acquire(false, rsrv, Mode::new(0), false, Event::NONE);
    assert!(e_retry.exists());

    // Releasing wakes the mode-0 retry first (lower number wins), leaving
    // the lock free with the mode-3 waiter still queued.
    node.release(rsrv, Event::NONE);
    assert_eq!(events.poll(e_retry), EventPoll::Triggered);
    assert_eq!(events.poll(e_blocked), EventPoll::Pending);
    with_state(&node, rsrv, |s| {
        assert_eq!(s.count, ZERO_COUNT);
        assert_eq!(s.local_waiters.len(), 1);
    });

    // A fresh mode-3 acquire gets the lock and takes the queued mode-3
    // waiter along as a bonus grant.
    let grant = node.acquire(rsrv, Mode::new(3), false, Event::NONE);
    assert!(!grant.exists());
    assert_eq!(events.poll(e_blocked), EventPoll::Triggered);
    with_state(&node, rsrv, |s| {
        assert_eq!(s.mode, Mode::new(3));
        assert_eq!(s.count, ZERO_COUNT + 2);
        assert!(s.local_waiters.is_empty());
    });

    // The woken try-acquirer retries and shares too.
    let retried = node.try_acquire(true, rsrv, Mode::new(0), false, Event::NONE);
    // Mode 0 does not match the mode-3 sharers, so the retry fails again
    // and re-queues.
    assert!(retried.exists());

    node.release(rsrv, Event::NONE);
    node.release(rsrv, Event::NONE);
}

#[test]
fn excl_waiter_preempts_shared() {
    let _trace = crate::util::test::trace_init();
    let (events, _net, node) = sim_node();
    let rsrv = node.create_reservation(0);

    let held = node.acquire(rsrv, Mode::new(3), false, Event::NONE);
    assert!(!held.exists());

    let e_excl = node.acquire(rsrv, Mode::new(0), true, Event::NONE);
    assert!(e_excl.exists());

    // A matching shared acquire may not jump the queued exclusive waiter.
    let e_shared = node.acquire(rsrv, Mode::new(3), false, Event::NONE);
    assert!(e_shared.exists());

    node.release(rsrv, Event::NONE);
    assert_eq!(events.poll(e_excl), EventPoll::Triggered);
    assert_eq!(events.poll(e_shared), EventPoll::Pending);
    with_state(&node, rsrv, |s| {
        assert_eq!(s.mode, Mode::EXCL);
        assert_eq!(s.count, ZERO_COUNT + 1);
    });

    node.release(rsrv, Event::NONE);
    assert_eq!(events.poll(e_shared), EventPoll::Triggered);
    with_state(&node, rsrv, |s| {
        assert_eq!(s.mode, Mode::new(3));
        assert_eq!(s.count, ZERO_COUNT + 1);
    });

    node.release(rsrv, Event::NONE);
}

#[test]
fn excl_retry_preempts_shared_waiters() {
    let _trace = crate::util::test::trace_init();
    let (events, _net, node) = sim_node();
    let rsrv = node.create_reservation(0);

    let held = node.acquire(rsrv, Mode::new(0), true, Event::NONE);
    assert!(!held.exists());

    // A failed exclusive try and a shared blocking waiter queue up behind
    // the holder.
    let r_excl = node.try_acquire(false, rsrv, Mode::new(0), true, Event::NONE);
    assert!(r_excl.exists());
    let e_shared = node.acquire(rsrv, Mode::new(3), false, Event::NONE);
    assert!(e_shared.exists());

    // The release wakes the exclusive retrier first, even though mode 3
    // sorts below the exclusive sentinel numerically.
    node.release(rsrv, Event::NONE);
    assert_eq!(events.poll(r_excl), EventPoll::Triggered);
    assert_eq!(events.poll(e_shared), EventPoll::Pending);
    with_state(&node, rsrv, |s| {
        assert_eq!(s.count, ZERO_COUNT, "retry wake leaves the lock free");
        assert_eq!(s.local_waiters.len(), 1);
    });

    // The retrier converts its wake into the exclusive hold.
    assert!(!node
        .try_acquire(true, rsrv, Mode::new(0), true, Event::NONE)
        .exists());
    with_state(&node, rsrv, |s| {
        assert_eq!(s.mode, Mode::EXCL);
        assert_eq!(s.count, ZERO_COUNT + 1);
        assert!(s.retry_count.is_empty());
    });
    assert_eq!(events.poll(e_shared), EventPoll::Pending);

    // Only once the exclusive holder is done does the shared waiter drain.
    node.release(rsrv, Event::NONE);
    assert_eq!(events.poll(e_shared), EventPoll::Triggered);
    node.release(rsrv, Event::NONE);
}

#[test]
fn try_acquire_retry_accounting() {
    let _trace = crate::util::test::trace_init();
    let (events, _net, node) = sim_node();
    let rsrv = node.create_reservation(0);

    let held = node.acquire(rsrv, Mode::new(0), true, Event::NONE);
    assert!(!held.exists());

    // Two failed tries in the same mode share one retry event and record
    // two retry obligations.
    let r1 = node.try_acquire(false, rsrv, Mode::new(0), false, Event::NONE);
    let r2 = node.try_acquire(false, rsrv, Mode::new(0), false, Event::NONE);
    assert!(r1.exists());
    assert_eq!(r1, r2);
    with_state(&node, rsrv, |s| {
        assert_eq!(s.retry_count.get(&Mode::new(0)), Some(&2));
    });

    node.release(rsrv, Event::NONE);
    assert_eq!(events.poll(r1), EventPoll::Triggered);
    with_state(&node, rsrv, |s| {
        assert_eq!(s.count, ZERO_COUNT, "retry wake leaves the lock free");
    });

    // Both retries succeed (the second joins the first as a sharer) and the
    // obligations drain to zero.
    assert!(!node
        .try_acquire(true, rsrv, Mode::new(0), false, Event::NONE)
        .exists());
    assert!(!node
        .try_acquire(true, rsrv, Mode::new(0), false, Event::NONE)
        .exists());
    with_state(&node, rsrv, |s| {
        assert!(s.retry_count.is_empty());
        assert_eq!(s.count, ZERO_COUNT + 2);
    });

    node.release(rsrv, Event::NONE);
    node.release(rsrv, Event::NONE);
}

#[test]
fn try_acquire_placeholder_records_obligation() {
    let _trace = crate::util::test::trace_init();
    let (events, _net, node) = sim_node();
    let rsrv = node.create_reservation(0);

    let precondition = events.create();
    let returned = node.try_acquire(false, rsrv, Mode::new(2), false, precondition);
    assert_eq!(
        returned, precondition,
        "a gated try hands back its precondition"
    );
    with_state(&node, rsrv, |s| {
        assert_eq!(s.retry_count.get(&Mode::new(2)), Some(&1));
        assert!(s.retry_events.is_empty(), "no attempt was made");
    });

    // Once the precondition fires, the caller retries for real.
    events.trigger(precondition, false);
    let grant = node.try_acquire(true, rsrv, Mode::new(2), false, Event::NONE);
    assert!(!grant.exists());
    with_state(&node, rsrv, |s| {
        assert!(s.retry_count.is_empty());
        assert_eq!(s.count, ZERO_COUNT + 1);
    });

    node.release(rsrv, Event::NONE);
}

#[test]
fn poisoned_deferred_acquire_never_touches_the_lock() {
    let _trace = crate::util::test::trace_init();
    let (events, net, node) = sim_node();
    let rsrv = node.create_reservation(0);

    let precondition = events.create();
    let grant = node.acquire(rsrv, Mode::new(0), true, precondition);
    assert!(grant.exists());
    assert_eq!(events.poll(grant), EventPoll::Pending);

    events.trigger(precondition, true);
    assert_eq!(events.poll(grant), EventPoll::Poisoned);
    with_state(&node, rsrv, |s| {
        assert_eq!(s.count, ZERO_COUNT);
        assert!(s.local_waiters.is_empty());
    });
    assert_eq!(net.pending(), 0, "no request was ever sent");
}

#[test]
fn deferred_acquire_runs_when_precondition_fires() {
    let _trace = crate::util::test::trace_init();
    let (events, _net, node) = sim_node();
    let rsrv = node.create_reservation(0);

    let precondition = events.create();
    let grant = node.acquire(rsrv, Mode::new(0), true, precondition);
    assert_eq!(events.poll(grant), EventPoll::Pending);

    events.trigger(precondition, false);
    assert_eq!(events.poll(grant), EventPoll::Triggered);
    with_state(&node, rsrv, |s| assert_eq!(s.count, ZERO_COUNT + 1));

    node.release(rsrv, Event::NONE);
}

#[test]
fn poisoned_deferred_release_declines() {
    let _trace = crate::util::test::trace_init();
    let (events, _net, node) = sim_node();
    let rsrv = node.create_reservation(0);

    assert!(!node.acquire(rsrv, Mode::new(0), true, Event::NONE).exists());

    let precondition = events.create();
    node.release(rsrv, precondition);
    events.trigger(precondition, true);

    // The release was skipped; the lock is still held.
    assert!(node.is_locked(rsrv, Mode::new(0), true));
    node.release(rsrv, Event::NONE);
}

#[test]
fn deferred_release_runs_when_precondition_fires() {
    let _trace = crate::util::test::trace_init();
    let (events, _net, node) = sim_node();
    let rsrv = node.create_reservation(0);

    assert!(!node.acquire(rsrv, Mode::new(0), true, Event::NONE).exists());

    let precondition = events.create();
    node.release(rsrv, precondition);
    assert!(node.is_locked(rsrv, Mode::new(0), true));

    events.trigger(precondition, false);
    assert!(!node.is_locked(rsrv, Mode::new(0), true));
}

#[test]
fn destroy_recycles_the_slot() {
    let _trace = crate::util::test::trace_init();
    let (_events, _net, node) = sim_node();

    let r1 = node.create_reservation(0);
    node.destroy_reservation(r1, Event::NONE);
    let r2 = node.create_reservation(0);
    assert_eq!(r1, r2, "the freed index is reused");

    // Destroying a held reservation waits for the exclusive grant.
    assert!(!node.acquire(r2, Mode::new(0), true, Event::NONE).exists());
    node.destroy_reservation(r2, Event::NONE);
    with_state(&node, r2, |s| {
        assert!(s.in_use, "destruction is still waiting on the holder");
    });
    node.release(r2, Event::NONE);
    with_state(&node, r2, |s| {
        assert!(!s.in_use);
        assert_eq!(s.count, ZERO_COUNT);
        assert_eq!(s.mode, Mode::EXCL);
        assert!(s.local_waiters.is_empty());
    });
    let r3 = node.create_reservation(0);
    assert_eq!(r3, r2);
}

#[test]
fn payload_travels_with_the_grant() {
    let _trace = crate::util::test::trace_init();
    let events = Arc::new(SimEvents::new());
    let net = Loopback::new();
    let n0 = net.join(NodeId::new(0), events.clone());
    let n1 = net.join(NodeId::new(1), events.clone());

    let rsrv = n0.create_reservation(4);
    assert!(!n0.acquire(rsrv, Mode::new(0), true, Event::NONE).exists());
    with_state(&n0, rsrv, |s| {
        assert_eq!(s.local_data, vec![0; 4]);
        s.local_data.copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
    });

    let grant = n1.acquire(rsrv, Mode::new(0), true, Event::NONE);
    assert!(grant.exists());
    net.pump();
    n0.release(rsrv, Event::NONE);
    net.pump();

    assert_eq!(events.poll(grant), EventPoll::Triggered);
    with_state(&n1, rsrv, |s| {
        assert_eq!(s.owner, n1.id());
        assert_eq!(s.local_data, vec![0xde, 0xad, 0xbe, 0xef]);
    });
    n1.release(rsrv, Event::NONE);
    net.pump();
}

#[test]
fn request_while_requested_sends_once() {
    let _trace = crate::util::test::trace_init();
    let events = Arc::new(SimEvents::new());
    let net = Loopback::new();
    let n0 = net.join(NodeId::new(0), events.clone());
    let n1 = net.join(NodeId::new(1), events.clone());

    let rsrv = n0.create_reservation(0);
    assert!(!n0.acquire(rsrv, Mode::new(0), true, Event::NONE).exists());

    // Two local waiters on node 1, one outstanding request.
    let e1 = n1.acquire(rsrv, Mode::new(0), true, Event::NONE);
    let e2 = n1.acquire(rsrv, Mode::new(0), true, Event::NONE);
    assert!(e1.exists() && e2.exists());
    assert_eq!(net.pending(), 1, "the requested flag dedups requests");
    with_state(&n1, rsrv, |s| assert!(s.requested));

    net.pump();
    n0.release(rsrv, Event::NONE);
    net.pump();

    // Both waiters were granted in turn (exclusive: one at a time).
    assert_eq!(events.poll(e1), EventPoll::Triggered);
    assert_eq!(events.poll(e2), EventPoll::Pending);
    n1.release(rsrv, Event::NONE);
    assert_eq!(events.poll(e2), EventPoll::Triggered);
    n1.release(rsrv, Event::NONE);
    assert_eq!(net.pending(), 0);
}
