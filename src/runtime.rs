//! Per-node runtime context: the slot table, deferred operations, and the
//! caller-facing reservation API.
//!
//! A [`Node`] is one node's view of the reservation space. It owns the slots
//! for every reservation created here (recycled through a free list) and
//! lazily materializes replica slots for reservations created elsewhere. All
//! caller-facing operations accept an optional precondition event; when the
//! precondition has not triggered yet, the operation is parked as a deferred
//! closure on the event layer and runs when it fires.

use core::fmt;
use std::collections::HashMap;
use std::sync::Arc;

use crate::event::{Event, EventPoll, EventWaiter, Events};
use crate::fast::FastReservation;
use crate::loom::sync::Mutex;
use crate::net::{Message, Network, NodeId, MAX_NODES};
use crate::rsrv::{AcquireKind, Mode, Reservation, Slot};

/// Configuration recognized by a [`Node`].
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// Construct every [`FastReservation`] in slow-fallback mode, routing
    /// all of its operations through the base reservation (allocating one if
    /// the caller did not supply it). Useful for testing and debugging the
    /// distributed path.
    pub use_fast_reservation_fallback: bool,
}

impl Config {
    /// Returns the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// The per-node state shared by every slot: who we are and how we reach the
/// collaborating subsystems.
pub(crate) struct Shared {
    pub(crate) id: NodeId,
    pub(crate) events: Arc<dyn Events>,
    pub(crate) network: Arc<dyn Network>,
}

struct Table {
    /// Slots created on this node, indexed by the handle's index field.
    /// Entries persist across destroy/create cycles.
    local: Vec<Arc<Slot>>,
    /// Indices of destroyed local slots awaiting reuse.
    free: Vec<u32>,
    /// Replica slots for reservations created on other nodes.
    remote: HashMap<Reservation, Arc<Slot>>,
}

struct NodeInner {
    shared: Arc<Shared>,
    table: Mutex<Table>,
    config: Config,
}

/// One node's view of the distributed reservation space.
///
/// `Node` is a cheaply cloneable handle; clones share the same slot table.
/// The containing runtime must route every incoming protocol message for
/// this node to [`Node::handle_message`].
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Creates a node context with the default [`Config`].
    #[must_use]
    pub fn new(id: NodeId, events: Arc<dyn Events>, network: Arc<dyn Network>) -> Self {
        Self::with_config(id, events, network, Config::default())
    }

    /// Creates a node context with an explicit [`Config`].
    ///
    /// # Panics
    ///
    /// If `id` is not below [`MAX_NODES`].
    #[must_use]
    pub fn with_config(
        id: NodeId,
        events: Arc<dyn Events>,
        network: Arc<dyn Network>,
        config: Config,
    ) -> Self {
        assert!(
            (id.into_raw() as usize) < MAX_NODES,
            "node id {id} out of range",
        );
        Self {
            inner: Arc::new(NodeInner {
                shared: Arc::new(Shared {
                    id,
                    events,
                    network,
                }),
                table: Mutex::new(Table {
                    local: Vec::new(),
                    free: Vec::new(),
                    remote: HashMap::new(),
                }),
                config,
            }),
        }
    }

    /// This node's identifier.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.inner.shared.id
    }

    /// The event layer this node hands grant events to.
    #[must_use]
    pub fn events(&self) -> &Arc<dyn Events> {
        &self.inner.shared.events
    }

    pub(crate) fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Creates a reservation homed on this node, owning `data_size` bytes of
    /// opaque payload that will travel with the lock.
    pub fn create_reservation(&self, data_size: usize) -> Reservation {
        let slot = {
            let mut table = self.inner.table.lock();
            if let Some(index) = table.free.pop() {
                table.local[index as usize].clone()
            } else {
                let index = table.local.len() as u32;
                let slot = Arc::new(Slot::new(
                    Reservation::from_parts(self.id(), index),
                    self.id(),
                    self.inner.shared.clone(),
                ));
                table.local.push(slot.clone());
                slot
            }
        };
        slot.activate(data_size);
        tracing::info!(rsrv = %slot.me(), "reservation created");
        slot.me()
    }

    /// Destroys `rsrv` once `wait_on` has triggered.
    ///
    /// A reservation must be destroyed on the node that created it, so the
    /// call is forwarded there if needed. The creator then takes the lock
    /// exclusively (waiting out any current holders) before recycling the
    /// slot.
    pub fn destroy_reservation(&self, rsrv: Reservation, wait_on: Event) {
        match self.inner.shared.events.poll(wait_on) {
            EventPoll::Pending => {
                tracing::info!(%rsrv, ?wait_on, "reservation destroy deferred");
                self.inner.shared.events.add_waiter(
                    wait_on,
                    Box::new(Deferred::Destroy {
                        node: self.clone(),
                        rsrv,
                    }),
                );
                return;
            }
            EventPoll::Poisoned => {
                tracing::info!(%rsrv, "poisoned reservation destruction skipped - POSSIBLE LEAK");
                return;
            }
            EventPoll::Triggered => {}
        }

        tracing::info!(%rsrv, "reservation destroyed");

        if rsrv.creator() != self.id() {
            self.inner
                .shared
                .network
                .send(rsrv.creator(), Message::Destroy { rsrv });
            return;
        }

        let slot = self.slot(rsrv);
        let grant = slot.acquire(Mode::new(0), true, AcquireKind::Blocking, Event::NONE);
        if self.inner.shared.events.poll(grant).has_triggered() {
            self.release_reservation(rsrv);
        } else {
            self.inner.shared.events.add_waiter(
                grant,
                Box::new(Deferred::Retire {
                    node: self.clone(),
                    rsrv,
                }),
            );
        }
    }

    /// Acquires `rsrv` in `mode` (coerced to [`Mode::EXCL`] if `exclusive`)
    /// once `wait_on` has triggered.
    ///
    /// The returned event triggers when the grant is made;
    /// [`Event::NONE`] means the grant already happened. A poisoned
    /// `wait_on` poisons the returned event without ever touching the lock.
    pub fn acquire(
        &self,
        rsrv: Reservation,
        mode: Mode,
        exclusive: bool,
        wait_on: Event,
    ) -> Event {
        match self.inner.shared.events.poll(wait_on) {
            EventPoll::Triggered => {
                let finish = self
                    .slot(rsrv)
                    .acquire(mode, exclusive, AcquireKind::Blocking, Event::NONE);
                tracing::info!(%rsrv, ?finish, "reservation acquire");
                finish
            }
            EventPoll::Pending => {
                let after_lock = self.inner.shared.events.create();
                tracing::info!(%rsrv, finish = ?after_lock, ?wait_on, "reservation acquire");
                self.inner.shared.events.add_waiter(
                    wait_on,
                    Box::new(Deferred::Acquire {
                        node: self.clone(),
                        rsrv,
                        mode,
                        exclusive,
                        after_lock,
                    }),
                );
                after_lock
            }
            EventPoll::Poisoned => {
                let after_lock = self.inner.shared.events.create();
                tracing::info!(%rsrv, finish = ?after_lock, "poisoned acquire precondition");
                self.inner.shared.events.trigger(after_lock, true);
                after_lock
            }
        }
    }

    /// Attempts to acquire `rsrv` without waiting.
    ///
    /// Returns [`Event::NONE`] on an immediate grant. On failure, returns
    /// the mode's shared retry event: when it triggers, call again with
    /// `retry = true`. If `wait_on` has not triggered yet, only the retry
    /// obligation is recorded and `wait_on` itself is returned; the real
    /// attempt happens after it fires.
    pub fn try_acquire(
        &self,
        retry: bool,
        rsrv: Reservation,
        mode: Mode,
        exclusive: bool,
        wait_on: Event,
    ) -> Event {
        let slot = self.slot(rsrv);

        if self.inner.shared.events.poll(wait_on) == EventPoll::Pending {
            slot.acquire(
                mode,
                exclusive,
                AcquireKind::NonblockingPlaceholder,
                Event::NONE,
            );
            tracing::info!(%rsrv, ?wait_on, "reservation try_acquire deferred");
            return wait_on;
        }

        let kind = if retry {
            AcquireKind::NonblockingRetry
        } else {
            AcquireKind::Nonblocking
        };
        let finish = slot.acquire(mode, exclusive, kind, Event::NONE);
        tracing::info!(%rsrv, ?finish, retry, "reservation try_acquire");
        finish
    }

    /// Releases one grant of `rsrv` once `wait_on` has triggered.
    pub fn release(&self, rsrv: Reservation, wait_on: Event) {
        match self.inner.shared.events.poll(wait_on) {
            EventPoll::Triggered => {
                tracing::info!(%rsrv, "reservation release");
                self.slot(rsrv).release();
            }
            EventPoll::Pending => {
                tracing::info!(%rsrv, ?wait_on, "reservation release deferred");
                self.inner.shared.events.add_waiter(
                    wait_on,
                    Box::new(Deferred::Release {
                        node: self.clone(),
                        rsrv,
                    }),
                );
            }
            EventPoll::Poisoned => {
                tracing::warn!(%rsrv, "poisoned reservation release skipped - POSSIBLE HANG");
            }
        }
    }

    /// Conservatively reports whether this node holds `rsrv` in
    /// `check_mode`, also accepting an exclusive hold if `excl_ok`.
    #[must_use]
    pub fn is_locked(&self, rsrv: Reservation, check_mode: Mode, excl_ok: bool) -> bool {
        self.slot(rsrv).is_locked(check_mode, excl_ok)
    }

    /// Constructs a [`FastReservation`] layered over `base` (or over
    /// nothing). Honors [`Config::use_fast_reservation_fallback`],
    /// allocating a backing reservation when the config demands one and the
    /// caller supplied none.
    #[must_use]
    pub fn fast_reservation(&self, base: Option<Reservation>) -> FastReservation {
        FastReservation::over_base(self.clone(), base)
    }

    /// Delivers an incoming protocol message to this node.
    pub fn handle_message(&self, from: NodeId, msg: Message) {
        match msg {
            Message::Request {
                requester,
                rsrv,
                mode,
            } => self.slot(rsrv).handle_request(requester, mode),
            Message::Grant {
                rsrv,
                mode,
                payload,
            } => self.slot(rsrv).handle_grant(mode, &payload),
            Message::Release { rsrv } => self.slot(rsrv).handle_release(from),
            Message::Destroy { rsrv } => self.destroy_reservation(rsrv, Event::NONE),
        }
    }

    /// Recycles a creator-side slot whose lock the caller holds
    /// exclusively.
    pub(crate) fn release_reservation(&self, rsrv: Reservation) {
        self.slot(rsrv).retire();
        tracing::info!(%rsrv, "releasing reservation");
        let mut table = self.inner.table.lock();
        table.free.push(rsrv.index());
    }

    /// Looks up (or, for a remote reservation, lazily creates) the slot for
    /// `rsrv`. A local handle that was never created here is a protocol
    /// bug.
    pub(crate) fn slot(&self, rsrv: Reservation) -> Arc<Slot> {
        assert!(rsrv.exists(), "the NIL reservation names no slot");
        let mut table = self.inner.table.lock();
        if rsrv.creator() == self.id() {
            table
                .local
                .get(rsrv.index() as usize)
                .unwrap_or_else(|| panic!("unknown reservation {rsrv}"))
                .clone()
        } else {
            table
                .remote
                .entry(rsrv)
                .or_insert_with(|| {
                    Arc::new(Slot::new(rsrv, rsrv.creator(), self.inner.shared.clone()))
                })
                .clone()
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node").field("id", &self.id()).finish_non_exhaustive()
    }
}

/// An operation parked on a precondition event.
///
/// Each variant runs its operation when the event triggers cleanly. On a
/// poisoned trigger, a deferred acquire propagates the poison to its grant
/// event; a deferred release or destruction declines to act (which may hang
/// or leak, respectively, and is logged as such).
enum Deferred {
    Acquire {
        node: Node,
        rsrv: Reservation,
        mode: Mode,
        exclusive: bool,
        after_lock: Event,
    },
    Release {
        node: Node,
        rsrv: Reservation,
    },
    Destroy {
        node: Node,
        rsrv: Reservation,
    },
    /// The tail of a destroy: the exclusive acquire was granted, so the
    /// slot can now be recycled.
    Retire {
        node: Node,
        rsrv: Reservation,
    },
}

impl EventWaiter for Deferred {
    fn event_triggered(self: Box<Self>, poisoned: bool) {
        match *self {
            Deferred::Acquire {
                node,
                rsrv,
                mode,
                exclusive,
                after_lock,
            } => {
                if poisoned {
                    tracing::info!(%rsrv, after = ?after_lock, "poisoned deferred acquire skipped");
                    node.inner.shared.events.trigger(after_lock, true);
                } else {
                    node.slot(rsrv)
                        .acquire(mode, exclusive, AcquireKind::Blocking, after_lock);
                }
            }
            Deferred::Release { node, rsrv } => {
                if poisoned {
                    tracing::warn!(%rsrv, "poisoned deferred release skipped - POSSIBLE HANG");
                } else {
                    node.slot(rsrv).release();
                }
            }
            Deferred::Destroy { node, rsrv } => {
                if poisoned {
                    tracing::info!(%rsrv, "poisoned deferred destruction skipped - POSSIBLE LEAK");
                } else {
                    node.destroy_reservation(rsrv, Event::NONE);
                }
            }
            Deferred::Retire { node, rsrv } => {
                if poisoned {
                    tracing::info!(%rsrv, "poisoned deferred destruction skipped - POSSIBLE LEAK");
                } else {
                    node.release_reservation(rsrv);
                }
            }
        }
    }
}
