//! In-process implementations of the event and network contracts.
//!
//! These exist for the test suite and for single-process runs: [`SimEvents`]
//! is a complete little event subsystem (trigger/poison/merge/waiters/
//! blocking), and [`Loopback`] is a message router connecting any number of
//! [`Node`]s in one process, delivering in global FIFO order when pumped.

use core::fmt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use crate::event::{Event, EventPoll, EventWaiter, Events};
use crate::net::{Message, Network, NodeId};
use crate::runtime::{Config, Node};

struct EvState {
    state: EventPoll,
    waiters: Vec<Box<dyn EventWaiter>>,
}

struct EventTable {
    next: u64,
    events: HashMap<u64, EvState>,
}

struct SimEventsInner {
    table: Mutex<EventTable>,
    cond: Condvar,
}

/// A single-process event subsystem.
///
/// Waiters are always fired *after* the internal lock is dropped, so they
/// may freely reenter the event layer or take reservation mutexes, as the
/// [`Events`] contract requires.
#[derive(Clone)]
pub struct SimEvents {
    inner: Arc<SimEventsInner>,
}

impl SimEvents {
    /// Creates an empty event table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SimEventsInner {
                table: Mutex::new(EventTable {
                    next: 1,
                    events: HashMap::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }
}

impl Default for SimEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl Events for SimEvents {
    fn create(&self) -> Event {
        let mut table = self.inner.table.lock().unwrap();
        let id = table.next;
        table.next += 1;
        table.events.insert(
            id,
            EvState {
                state: EventPoll::Pending,
                waiters: Vec::new(),
            },
        );
        Event::from_raw(id)
    }

    fn poll(&self, event: Event) -> EventPoll {
        if !event.exists() {
            return EventPoll::Triggered;
        }
        let table = self.inner.table.lock().unwrap();
        table
            .events
            .get(&event.into_raw())
            .unwrap_or_else(|| panic!("poll of unknown event {event:?}"))
            .state
    }

    fn trigger(&self, event: Event, poisoned: bool) {
        assert!(event.exists(), "the no-op event cannot be triggered");
        let waiters = {
            let mut table = self.inner.table.lock().unwrap();
            let ev = table
                .events
                .get_mut(&event.into_raw())
                .unwrap_or_else(|| panic!("trigger of unknown event {event:?}"));
            assert_eq!(
                ev.state,
                EventPoll::Pending,
                "event {event:?} triggered twice"
            );
            ev.state = if poisoned {
                EventPoll::Poisoned
            } else {
                EventPoll::Triggered
            };
            std::mem::take(&mut ev.waiters)
        };
        self.inner.cond.notify_all();
        for waiter in waiters {
            waiter.event_triggered(poisoned);
        }
    }

    fn merge(&self, events: &[Event]) -> Event {
        let mut pending = Vec::new();
        let mut poisoned = false;
        for &event in events {
            match self.poll(event) {
                EventPoll::Pending => pending.push(event),
                EventPoll::Poisoned => poisoned = true,
                EventPoll::Triggered => {}
            }
        }

        if pending.is_empty() {
            if !poisoned {
                return Event::NONE;
            }
            let merged = self.create();
            self.trigger(merged, true);
            return merged;
        }

        let merged = self.create();
        let state = Arc::new(Mutex::new(MergeState {
            remaining: pending.len(),
            poisoned,
        }));
        for &event in &pending {
            self.add_waiter(
                event,
                Box::new(MergeWaiter {
                    events: self.clone(),
                    target: merged,
                    state: state.clone(),
                }),
            );
        }
        merged
    }

    fn add_waiter(&self, event: Event, waiter: Box<dyn EventWaiter>) {
        let fire = {
            let mut table = self.inner.table.lock().unwrap();
            let ev = table
                .events
                .get_mut(&event.into_raw())
                .unwrap_or_else(|| panic!("waiter on unknown event {event:?}"));
            match ev.state {
                EventPoll::Pending => {
                    ev.waiters.push(waiter);
                    None
                }
                EventPoll::Triggered => Some((waiter, false)),
                EventPoll::Poisoned => Some((waiter, true)),
            }
        };
        if let Some((waiter, poisoned)) = fire {
            waiter.event_triggered(poisoned);
        }
    }

    fn block_on(&self, event: Event) {
        if !event.exists() {
            return;
        }
        let mut table = self.inner.table.lock().unwrap();
        while table
            .events
            .get(&event.into_raw())
            .unwrap_or_else(|| panic!("block_on unknown event {event:?}"))
            .state
            == EventPoll::Pending
        {
            table = self.inner.cond.wait(table).unwrap();
        }
    }
}

impl fmt::Debug for SimEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.inner.table.lock().unwrap();
        f.debug_struct("SimEvents")
            .field("events", &table.events.len())
            .finish_non_exhaustive()
    }
}

struct MergeState {
    remaining: usize,
    poisoned: bool,
}

struct MergeWaiter {
    events: SimEvents,
    target: Event,
    state: Arc<Mutex<MergeState>>,
}

impl EventWaiter for MergeWaiter {
    fn event_triggered(self: Box<Self>, poisoned: bool) {
        let fire = {
            let mut state = self.state.lock().unwrap();
            state.poisoned |= poisoned;
            state.remaining -= 1;
            (state.remaining == 0).then_some(state.poisoned)
        };
        if let Some(poisoned) = fire {
            self.events.trigger(self.target, poisoned);
        }
    }
}

struct LoopbackInner {
    queue: Mutex<VecDeque<(NodeId, NodeId, Message)>>,
    nodes: Mutex<HashMap<u16, Node>>,
}

/// An in-process message router.
///
/// Sends enqueue; nothing is delivered until [`Loopback::pump`] (or
/// [`Loopback::step`]) runs, which keeps tests deterministic and lets them
/// interleave deliveries with local operations. The single global FIFO
/// trivially preserves the required per-direction send order.
#[derive(Clone)]
pub struct Loopback {
    inner: Arc<LoopbackInner>,
}

impl Loopback {
    /// Creates a router with no nodes attached.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LoopbackInner {
                queue: Mutex::new(VecDeque::new()),
                nodes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Creates a [`Node`] attached to this router.
    pub fn join(&self, id: NodeId, events: Arc<dyn Events>) -> Node {
        self.join_with_config(id, events, Config::default())
    }

    /// Creates a [`Node`] attached to this router, with an explicit
    /// [`Config`].
    pub fn join_with_config(&self, id: NodeId, events: Arc<dyn Events>, config: Config) -> Node {
        let port = Port {
            net: self.clone(),
            from: id,
        };
        let node = Node::with_config(id, events, Arc::new(port), config);
        self.inner.nodes.lock().unwrap().insert(id.into_raw(), node.clone());
        node
    }

    /// Delivers a single queued message, if any. Returns `false` when the
    /// queue was empty.
    pub fn step(&self) -> bool {
        let next = self.inner.queue.lock().unwrap().pop_front();
        let Some((from, to, msg)) = next else {
            return false;
        };
        let node = self
            .inner
            .nodes
            .lock()
            .unwrap()
            .get(&to.into_raw())
            .unwrap_or_else(|| panic!("message for unknown node {to}"))
            .clone();
        tracing::trace!(%from, %to, ?msg, "loopback deliver");
        node.handle_message(from, msg);
        true
    }

    /// Delivers queued messages (including ones enqueued by the handlers it
    /// runs) until none remain. Returns how many were delivered.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        while self.step() {
            delivered += 1;
        }
        delivered
    }

    /// The number of messages currently queued.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }
}

impl Default for Loopback {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Loopback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loopback")
            .field("pending", &self.pending())
            .field("nodes", &self.inner.nodes.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}

struct Port {
    net: Loopback,
    from: NodeId,
}

impl Network for Port {
    fn send(&self, to: NodeId, msg: Message) {
        tracing::trace!(from = %self.from, %to, ?msg, "loopback send");
        self.net
            .inner
            .queue
            .lock()
            .unwrap()
            .push_back((self.from, to, msg));
    }
}
