#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

pub(crate) mod loom;

#[macro_use]
pub(crate) mod util;

pub mod event;
pub mod fast;
pub mod net;
pub mod rsrv;
pub mod runtime;
pub mod sim;

#[doc(inline)]
pub use self::event::{Event, EventPoll, EventWaiter, Events};
#[doc(inline)]
pub use self::fast::{FastReservation, WaitMode};
#[doc(inline)]
pub use self::net::{Message, Network, NodeId, NodeSet, MAX_NODES};
#[doc(inline)]
pub use self::rsrv::{Mode, Reservation};
#[doc(inline)]
pub use self::runtime::{Config, Node};
