//! Stable integer handles used throughout the bus.
//!
//! The core registries are modelled as arenas keyed by these IDs rather than as graphs of
//! `Rc`/`RefCell` pointers: a [`Peer`](crate::peer::Peer) refers to the names it owns by name
//! string, a [`Name`](crate::name_registry::Name) refers to its claimants by [`PeerId`], and a
//! match rule refers to its owner the same way. Every cross-reference is resolved by looking the
//! ID up in the owning `HashMap`, never by following a pointer.

use std::fmt;

/// Unique identifier assigned to a peer when it connects.
///
/// IDs are handed out by [`Bus`](crate::bus::Bus) from a monotonic counter starting at 1 and are
/// never reused, even after the peer disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(u64);

/// Reserved value meaning "unset" or "no such peer". Never allocated to a real peer.
pub const ADDRESS_ID_INVALID: PeerId = PeerId(u64::MAX);

/// Synthetic sender identity used for messages the driver itself originates (`NameOwnerChanged`
/// and friends). `next_peer_id` starts at 1 and only grows, so this is never handed to a real
/// peer; it exists purely so `Bus::broadcast`'s sender-gated `driver_matches` candidates only
/// fire for messages that actually came from the driver.
pub const DRIVER_PEER_ID: PeerId = PeerId(u64::MAX - 1);

impl PeerId {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn is_invalid(self) -> bool {
        self.0 == ADDRESS_ID_INVALID.0
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Formats this ID the way D-Bus unique names are written: `:1.<id>`.
    pub fn to_unique_name(self) -> String {
        format!(":1.{}", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            write!(f, "<invalid>")
        } else {
            write!(f, ":1.{}", self.0)
        }
    }
}

impl Default for PeerId {
    fn default() -> Self {
        ADDRESS_ID_INVALID
    }
}

/// Monotonically increasing tag assigned to each broadcast transaction, used to deduplicate
/// delivery to a peer matched by more than one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TransactionId(u64);

impl TransactionId {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one [`MatchRule`](crate::match_rule::MatchRule) in the bus-wide arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MatchRuleId(u64);

impl MatchRuleId {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for MatchRuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifies one [`ReplySlot`](crate::reply::ReplySlot) in the bus-wide arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplySlotId(u64);

impl ReplySlotId {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }
}

/// A monotonic counter used to hand out the ID types above.
#[derive(Debug, Default)]
pub struct Counter(u64);

impl Counter {
    pub fn new() -> Self {
        Self(0)
    }

    /// Returns the next value, starting at 1 (0 is reserved as "never issued").
    pub fn next(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }

    /// Returns the value [`Self::next`] would hand out, without consuming it.
    pub fn peek_next(&self) -> u64 {
        self.0 + 1
    }
}
