//! Node identity, node sets, and the wire protocol.
//!
//! Reservations span nodes, so slots need to name their peers ([`NodeId`]),
//! track groups of them compactly ([`NodeSet`]), and exchange the four
//! protocol messages ([`Message`]) through whatever transport the containing
//! runtime provides ([`Network`]).
//!
//! The transport contract is small: messages sent from one node to another
//! are eventually delivered, and deliveries along a single sender→receiver
//! direction preserve send order. Nothing is assumed about ordering between
//! different directed pairs.

use core::fmt;

use crate::rsrv::{Mode, Reservation};

/// The maximum number of nodes a [`NodeSet`] can track.
///
/// Node identifiers must be below this bound anywhere a set of them is kept
/// (waiter masks, sharer masks).
pub const MAX_NODES: usize = 256;

const WORDS: usize = MAX_NODES / 64;

/// Identifies one node of the cluster.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u16);

impl NodeId {
    /// Returns the node id for `id`.
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// Returns the raw numeric identifier.
    #[must_use]
    pub const fn into_raw(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A compact set of node identifiers.
///
/// Iteration order is ascending; [`NodeSet::first`] returns the
/// lowest-numbered member, which is how the owner picks the next owner when
/// a reservation migrates.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct NodeSet {
    words: [u64; WORDS],
}

impl NodeSet {
    /// Returns an empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self { words: [0; WORDS] }
    }

    /// Adds `node` to the set.
    pub fn add(&mut self, node: NodeId) {
        let (word, bit) = Self::index(node);
        self.words[word] |= 1 << bit;
    }

    /// Removes `node` from the set.
    pub fn remove(&mut self, node: NodeId) {
        let (word, bit) = Self::index(node);
        self.words[word] &= !(1 << bit);
    }

    /// Returns `true` if `node` is a member.
    #[must_use]
    pub fn contains(&self, node: NodeId) -> bool {
        let (word, bit) = Self::index(node);
        self.words[word] & (1 << bit) != 0
    }

    /// Returns `true` if the set has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Returns the number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Returns the lowest-numbered member, if any.
    #[must_use]
    pub fn first(&self) -> Option<NodeId> {
        self.iter().next()
    }

    /// Adds every member of `other` to this set.
    pub fn union(&mut self, other: &NodeSet) {
        for (mine, theirs) in self.words.iter_mut().zip(other.words.iter()) {
            *mine |= theirs;
        }
    }

    /// Iterates the members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &word)| {
            let base = wi as u16 * 64;
            BitIter { word, base }
        })
    }

    fn index(node: NodeId) -> (usize, u32) {
        let id = node.into_raw() as usize;
        assert!(id < MAX_NODES, "node id {id} out of range for NodeSet");
        (id / 64, (id % 64) as u32)
    }
}

struct BitIter {
    word: u64,
    base: u16,
}

impl Iterator for BitIter {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        if self.word == 0 {
            return None;
        }
        let bit = self.word.trailing_zeros() as u16;
        self.word &= self.word - 1;
        Some(NodeId::new(self.base + bit))
    }
}

impl fmt::Debug for NodeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<NodeId> for NodeSet {
    fn from_iter<I: IntoIterator<Item = NodeId>>(iter: I) -> Self {
        let mut set = Self::new();
        for node in iter {
            set.add(node);
        }
        set
    }
}

/// A protocol message between two nodes' views of the reservation space.
///
/// Deliver incoming messages to [`Node::handle_message`]. Only
/// [`Message::Grant`] carries a variable-length payload; the other three are
/// fixed-size headers.
///
/// [`Node::handle_message`]: crate::runtime::Node::handle_message
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// `requester` wants `rsrv` in `mode`. Sent to the presumed owner, and
    /// forwarded if ownership has moved on.
    Request {
        /// The node that wants the reservation (preserved across forwards).
        requester: NodeId,
        /// The reservation being requested.
        rsrv: Reservation,
        /// The mode the requester wants.
        mode: Mode,
    },
    /// The reservation has been granted to the receiver. A grant in
    /// [`Mode::EXCL`] transfers ownership.
    Grant {
        /// The reservation being granted.
        rsrv: Reservation,
        /// The granted mode.
        mode: Mode,
        /// Encoded waiter mask plus the reservation's opaque payload; see
        /// [`encode_grant_payload`].
        payload: Vec<u8>,
    },
    /// A remote sharer of `rsrv` has released its last local grant.
    Release {
        /// The reservation being released.
        rsrv: Reservation,
    },
    /// Forwarded destruction: `rsrv` must be destroyed on its creator node.
    Destroy {
        /// The reservation being destroyed.
        rsrv: Reservation,
    },
}

/// The transport this crate sends protocol messages through.
///
/// Implementations must deliver every message eventually and preserve the
/// order of messages sent along the same sender→receiver direction. Sends
/// must not reenter the reservation layer synchronously on the sending
/// thread; this crate only sends while holding no slot mutex, and delivery
/// on the receiving side may take them freely.
pub trait Network: Send + Sync {
    /// Queues `msg` for delivery to `to`.
    fn send(&self, to: NodeId, msg: Message);
}

/// Encodes a grant payload: waiter count, the waiter ids in ascending order
/// (both as little-endian `i32`s), then the reservation's opaque data.
#[must_use]
pub(crate) fn encode_grant_payload(waiters: &NodeSet, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity((waiters.len() + 1) * 4 + data.len());
    buf.extend_from_slice(&(waiters.len() as i32).to_le_bytes());
    for node in waiters.iter() {
        buf.extend_from_slice(&(node.into_raw() as i32).to_le_bytes());
    }
    buf.extend_from_slice(data);
    buf
}

/// Decodes a grant payload into the waiter mask and the opaque data bytes.
///
/// A malformed payload is a protocol bug, not an input error, so this
/// panics rather than recovering.
pub(crate) fn decode_grant_payload(payload: &[u8]) -> (NodeSet, &[u8]) {
    let (count, rest) = payload.split_at(4);
    let count = i32::from_le_bytes(count.try_into().unwrap()) as usize;
    assert!(
        rest.len() >= count * 4,
        "grant payload truncated: {} waiters, {} bytes",
        count,
        rest.len()
    );
    let (ids, data) = rest.split_at(count * 4);
    let mut waiters = NodeSet::new();
    for id in ids.chunks_exact(4) {
        let id = i32::from_le_bytes(id.try_into().unwrap());
        waiters.add(NodeId::new(id as u16));
    }
    (waiters, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_set_ordering() {
        let mut set = NodeSet::new();
        set.add(NodeId::new(200));
        set.add(NodeId::new(3));
        set.add(NodeId::new(64));
        assert_eq!(set.first(), Some(NodeId::new(3)));
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![NodeId::new(3), NodeId::new(64), NodeId::new(200)]
        );
        assert_eq!(set.len(), 3);

        set.remove(NodeId::new(3));
        assert_eq!(set.first(), Some(NodeId::new(64)));
        set.remove(NodeId::new(64));
        set.remove(NodeId::new(200));
        assert!(set.is_empty());
    }

    #[test]
    fn node_set_union() {
        let a: NodeSet = [1u16, 5].into_iter().map(NodeId::new).collect();
        let mut b: NodeSet = [5u16, 70].into_iter().map(NodeId::new).collect();
        b.union(&a);
        assert_eq!(
            b.iter().collect::<Vec<_>>(),
            vec![NodeId::new(1), NodeId::new(5), NodeId::new(70)]
        );
    }

    #[test]
    fn grant_payload_round_trip() {
        let waiters: NodeSet = [2u16, 7, 65].into_iter().map(NodeId::new).collect();
        let payload = encode_grant_payload(&waiters, b"opaque");
        let (decoded, data) = decode_grant_payload(&payload);
        assert_eq!(decoded, waiters);
        assert_eq!(data, b"opaque");
    }

    #[test]
    fn grant_payload_empty() {
        let payload = encode_grant_payload(&NodeSet::new(), &[]);
        assert_eq!(payload, vec![0, 0, 0, 0]);
        let (decoded, data) = decode_grant_payload(&payload);
        assert!(decoded.is_empty());
        assert!(data.is_empty());
    }

    #[test]
    #[should_panic(expected = "truncated")]
    fn grant_payload_truncated() {
        let payload = encode_grant_payload(&NodeSet::new(), &[]);
        let mut bad = payload;
        bad[0] = 3;
        let _ = decode_grant_payload(&bad);
    }
}
