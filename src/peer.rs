//! Peer connection state (§4.6).
//!
//! A [`Peer`] is addressed from everywhere else on the bus by its [`PeerId`]; the struct itself
//! lives in exactly one place, `Bus::peers`. The state machine below is enforced by
//! [`PeerState::transition`] rather than scattered `if` checks at each call site.

use std::collections::{HashMap, VecDeque};

use zbus::Message;

use crate::{
    collaborators::{Codec, PeerCredentials},
    ids::{PeerId, TransactionId},
    match_rule::MatchRegistry,
    user::{Charge, Uid},
};

/// A peer's position in its connection lifecycle (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Authenticating,
    Authenticated,
    Registered,
    Monitor,
    Disconnecting,
    Freed,
}

impl PeerState {
    /// Validates a transition, returning `false` for anything not in the §4.6 state diagram.
    /// `become_monitor` is a one-way trip: `Registered -> Monitor` only, never back.
    pub fn can_transition_to(self, next: PeerState) -> bool {
        use PeerState::*;
        matches!(
            (self, next),
            (New, Authenticating)
                | (Authenticating, Authenticated)
                | (Authenticated, Registered)
                | (Registered, Monitor)
                | (Registered, Disconnecting)
                | (Monitor, Disconnecting)
                | (Disconnecting, Freed)
        )
    }
}

/// One connected client.
pub struct Peer {
    id: PeerId,
    state: PeerState,
    credentials: PeerCredentials,
    codec: Box<dyn Codec>,
    /// Rules placed here because their `sender=` key names this peer by unique ID (§4.2
    /// placement rule 3).
    matches: MatchRegistry,
    /// Well-known names this peer currently holds primary ownership of, kept for the §4.6 step 3
    /// goodbye cascade so it doesn't need to scan the whole name table.
    owned_names: Vec<String>,
    /// Messages queued for delivery, paired with the BYTES charge held against their sender (if
    /// any) — driver-built replies and signals carry no charge of their own.
    outbox: VecDeque<(Message, Option<Charge>)>,
    /// The `Objects` quota charge taken for this connection when it was accepted, held here so
    /// the goodbye cascade can release the exact token rather than recharging a throwaway amount.
    objects_charge: Option<Charge>,
    /// One `Names` quota charge per well-known name this peer currently owns primarily, mirroring
    /// `owned_names` so the driver can release exactly the right token on `NameLost`.
    name_charges: HashMap<String, Charge>,
    /// The transaction ID of the last broadcast delivered to this peer, so a message matched by
    /// more than one of the peer's rules in the same broadcast enqueues only once.
    last_delivered_txn: Option<TransactionId>,
}

impl Peer {
    pub fn new(id: PeerId, credentials: PeerCredentials, codec: Box<dyn Codec>) -> Self {
        Self {
            id,
            state: PeerState::New,
            credentials,
            codec,
            matches: MatchRegistry::default(),
            owned_names: Vec::new(),
            outbox: VecDeque::new(),
            objects_charge: None,
            name_charges: HashMap::new(),
            last_delivered_txn: None,
        }
    }

    /// Records that `txn` is being delivered to this peer, returning `false` (without updating
    /// the record) if this exact transaction was already delivered. Call before enqueuing a
    /// broadcast copy so matching the same message through more than one rule is a no-op past the
    /// first delivery.
    pub fn mark_delivered(&mut self, txn: TransactionId) -> bool {
        if self.last_delivered_txn == Some(txn) {
            return false;
        }
        self.last_delivered_txn = Some(txn);
        true
    }

    pub fn pid(&self) -> Option<u32> {
        self.credentials.pid
    }

    pub fn set_objects_charge(&mut self, charge: Charge) {
        self.objects_charge = Some(charge);
    }

    pub fn take_objects_charge(&mut self) -> Option<Charge> {
        self.objects_charge.take()
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn uid(&self) -> Uid {
        self.credentials.uid
    }

    pub fn username(&self) -> Option<&str> {
        self.credentials.username.as_deref()
    }

    pub fn groups(&self) -> &[u32] {
        &self.credentials.groups
    }

    pub fn unique_name(&self) -> String {
        self.id.to_unique_name()
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_monitor(&self) -> bool {
        self.state == PeerState::Monitor
    }

    /// Attempts a state transition, returning whether it was legal. Illegal transitions are a
    /// caller bug (protocol violations are handled by disconnecting, not by calling this).
    #[must_use]
    pub fn transition(&mut self, next: PeerState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        true
    }

    pub fn matches(&self) -> &MatchRegistry {
        &self.matches
    }

    pub fn matches_mut(&mut self) -> &mut MatchRegistry {
        &mut self.matches
    }

    pub fn owned_names(&self) -> &[String] {
        &self.owned_names
    }

    pub fn note_name_owned(&mut self, name: String) {
        if !self.owned_names.contains(&name) {
            self.owned_names.push(name);
        }
    }

    pub fn note_name_released(&mut self, name: &str) {
        self.owned_names.retain(|n| n != name);
    }

    pub fn set_name_charge(&mut self, name: String, charge: Charge) {
        self.name_charges.insert(name, charge);
    }

    pub fn take_name_charge(&mut self, name: &str) -> Option<Charge> {
        self.name_charges.remove(name)
    }

    /// Queues a message for delivery without blocking; the dispatch loop's write phase (§4.7)
    /// drains outboxes through [`Self::codec_mut`]. Carries no BYTES charge — for driver replies
    /// and signals, which aren't charged against any sender's quota.
    pub fn enqueue(&mut self, message: Message) {
        self.outbox.push_back((message, None));
    }

    /// Like [`Self::enqueue`], but holds `charge` against the message until it leaves the outbox
    /// (popped by [`Self::pop_outbox`] or drained by [`Self::take_outbox_charges`]).
    pub fn enqueue_charged(&mut self, message: Message, charge: Charge) {
        self.outbox.push_back((message, Some(charge)));
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    /// Pops the next message to send, along with the charge (if any) that must be released now
    /// that it's unlinked from the outbox.
    pub fn pop_outbox(&mut self) -> Option<(Message, Option<Charge>)> {
        self.outbox.pop_front()
    }

    /// Drains every charge still held by queued-but-undelivered messages, for release when the
    /// peer disconnects and its outbox is discarded unsent.
    pub fn take_outbox_charges(&mut self) -> Vec<Charge> {
        self.outbox.drain(..).filter_map(|(_, charge)| charge).collect()
    }

    pub fn codec_mut(&mut self) -> &mut dyn Codec {
        self.codec.as_mut()
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("uid", &self.credentials.uid)
            .field("owned_names", &self.owned_names)
            .field("outbox_len", &self.outbox.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_rejects_skipping_authentication() {
        let mut state = PeerState::New;
        assert!(!state.can_transition_to(PeerState::Registered));
        assert!(state.can_transition_to(PeerState::Authenticating));
        state = PeerState::Authenticating;
        assert!(state.can_transition_to(PeerState::Authenticated));
    }

    #[test]
    fn become_monitor_is_one_way() {
        assert!(PeerState::Registered.can_transition_to(PeerState::Monitor));
        assert!(!PeerState::Monitor.can_transition_to(PeerState::Registered));
        assert!(PeerState::Monitor.can_transition_to(PeerState::Disconnecting));
    }
}
