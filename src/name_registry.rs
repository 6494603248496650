//! Well-known name ownership (§4.3).
//!
//! A [`Name`] tracks its primary owner plus an ordered queue of peers waiting for it. The
//! registry never emits signals itself — `RequestName`/`ReleaseName`/peer disconnect all return a
//! list of [`NameEvent`]s describing what happened, and the driver (§4.8) turns those into
//! `NameOwnerChanged`/`NameLost`/`NameAcquired` signals. This keeps the ownership bookkeeping
//! testable without a live bus connection.

use std::collections::HashMap;

use enumflags2::{bitflags, BitFlags};

use crate::{error::BusError, ids::PeerId, match_rule::MatchRegistry};

/// Flags accepted by `RequestName` (§4.8), mirroring `org.freedesktop.DBus.RequestName`.
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestNameFlag {
    AllowReplacement = 0x1,
    ReplaceExisting = 0x2,
    DoNotQueue = 0x4,
}

pub type RequestNameFlags = BitFlags<RequestNameFlag>;

/// Outcome of a `RequestName` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestNameReply {
    PrimaryOwner,
    InQueue,
    Exists,
    AlreadyOwner,
}

impl RequestNameReply {
    /// The `u32` reply code `org.freedesktop.DBus.RequestName` puts on the wire.
    pub fn as_u32(self) -> u32 {
        match self {
            RequestNameReply::PrimaryOwner => 1,
            RequestNameReply::InQueue => 2,
            RequestNameReply::Exists => 3,
            RequestNameReply::AlreadyOwner => 4,
        }
    }
}

/// Outcome of a `ReleaseName` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseNameReply {
    Released,
    NonExistent,
    NotOwner,
}

impl ReleaseNameReply {
    /// The `u32` reply code `org.freedesktop.DBus.ReleaseName` puts on the wire.
    pub fn as_u32(self) -> u32 {
        match self {
            ReleaseNameReply::Released => 1,
            ReleaseNameReply::NonExistent => 2,
            ReleaseNameReply::NotOwner => 3,
        }
    }
}

/// A name-ownership change the caller must turn into wire signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameEvent {
    /// `NameOwnerChanged(name, old, new)`: `old`/`new` are empty unique names when absent, per the
    /// wire signature, so we carry `Option<PeerId>` and let the caller format it.
    OwnerChanged {
        name: String,
        old: Option<PeerId>,
        new: Option<PeerId>,
    },
    /// `NameLost(name)` delivered to `peer`.
    Lost { name: String, peer: PeerId },
    /// `NameAcquired(name)` delivered to `peer`.
    Acquired { name: String, peer: PeerId },
}

#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    peer: PeerId,
    allow_replacement: bool,
    do_not_queue: bool,
}

/// One well-known name's ownership state.
///
/// `match_refs` counts `MatchRule`s placed here because their `sender=` key names this exact
/// name (§4.2 `Placement::Name`); such a rule holds a reference on the name so the registry
/// cannot drop it out from under the rule even while the name is temporarily unowned.
#[derive(Debug, Default)]
pub struct Name {
    primary: Option<QueueEntry>,
    queue: Vec<QueueEntry>,
    matches: MatchRegistry,
    match_refs: u32,
}

impl Name {
    pub fn owner(&self) -> Option<PeerId> {
        self.primary.map(|e| e.peer)
    }

    pub fn queued_owners(&self) -> Vec<PeerId> {
        self.primary
            .iter()
            .chain(self.queue.iter())
            .map(|e| e.peer)
            .collect()
    }

    pub fn matches(&self) -> &MatchRegistry {
        &self.matches
    }

    fn is_empty(&self) -> bool {
        self.primary.is_none() && self.queue.is_empty() && self.match_refs == 0
    }
}

/// Owns every well-known name's ownership state.
#[derive(Debug, Default)]
pub struct NameRegistry {
    names: HashMap<String, Name>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, name: &str) -> Option<PeerId> {
        self.names.get(name).and_then(Name::owner)
    }

    pub fn queued_owners(&self, name: &str) -> Vec<PeerId> {
        self.names
            .get(name)
            .map(Name::queued_owners)
            .unwrap_or_default()
    }

    pub fn has_owner(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    pub fn names_owned_by(&self, peer: PeerId) -> Vec<String> {
        self.names
            .iter()
            .filter(|(_, n)| n.owner() == Some(peer))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Links a match rule into `name`'s registry, creating a (currently unowned) `Name` entry if
    /// necessary and pinning it via `match_refs` so it survives having no owner.
    pub fn link_match(
        &mut self,
        name: &str,
        id: crate::ids::MatchRuleId,
        eavesdrop: bool,
    ) {
        let entry = self.names.entry(name.to_string()).or_default();
        entry.matches.link(id, eavesdrop);
        entry.match_refs += 1;
    }

    /// Reverses [`Self::link_match`], dropping the `Name` entry entirely if it ends up both
    /// unowned and unreferenced.
    pub fn unlink_match(&mut self, name: &str, id: crate::ids::MatchRuleId) {
        if let Some(entry) = self.names.get_mut(name) {
            entry.matches.unlink(id);
            entry.match_refs = entry.match_refs.saturating_sub(1);
            if entry.is_empty() {
                self.names.remove(name);
            }
        }
    }

    pub fn matches_for(&self, name: &str) -> Option<&MatchRegistry> {
        self.names.get(name).map(Name::matches)
    }

    pub fn list_names(&self) -> Vec<String> {
        self.names
            .iter()
            .filter(|(_, n)| n.owner().is_some())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Validates a name is requestable at all: must not be empty, must not start with `:` (that's
    /// a unique name), and must not be the driver's own name.
    pub fn validate_requestable(name: &str) -> Result<(), BusError> {
        if name.starts_with(':') {
            return Err(BusError::NameUnique(name.to_string()));
        }
        if name == crate::match_rule::DRIVER_NAME {
            return Err(BusError::NameReserved(name.to_string()));
        }
        if name.is_empty() || !name.contains('.') {
            return Err(BusError::Invalid {
                what: "bus name",
                reason: format!("`{name}` is not a valid well-known name"),
            });
        }
        Ok(())
    }

    /// `RequestName` (§4.8 / §4.3).
    pub fn request_name(
        &mut self,
        name: &str,
        peer: PeerId,
        flags: RequestNameFlags,
    ) -> (RequestNameReply, Vec<NameEvent>) {
        let entry = self.names.entry(name.to_string()).or_default();
        let allow_replacement = flags.contains(RequestNameFlag::AllowReplacement);
        let do_not_queue = flags.contains(RequestNameFlag::DoNotQueue);

        match entry.primary {
            None => {
                entry.primary = Some(QueueEntry {
                    peer,
                    allow_replacement,
                    do_not_queue,
                });
                (
                    RequestNameReply::PrimaryOwner,
                    vec![
                        NameEvent::OwnerChanged {
                            name: name.to_string(),
                            old: None,
                            new: Some(peer),
                        },
                        NameEvent::Acquired {
                            name: name.to_string(),
                            peer,
                        },
                    ],
                )
            }
            Some(current) if current.peer == peer => (RequestNameReply::AlreadyOwner, Vec::new()),
            Some(current) => {
                let can_replace =
                    flags.contains(RequestNameFlag::ReplaceExisting) && current.allow_replacement;
                if can_replace {
                    entry.primary = Some(QueueEntry {
                        peer,
                        allow_replacement,
                        do_not_queue,
                    });
                    entry.queue.retain(|e| e.peer != peer);
                    let events = vec![
                        NameEvent::OwnerChanged {
                            name: name.to_string(),
                            old: Some(current.peer),
                            new: Some(peer),
                        },
                        NameEvent::Lost {
                            name: name.to_string(),
                            peer: current.peer,
                        },
                        NameEvent::Acquired {
                            name: name.to_string(),
                            peer,
                        },
                    ];
                    // The displaced owner rejoins the queue unless it held do-not-queue itself, in
                    // which case it is dropped rather than requeued.
                    if !current.do_not_queue {
                        entry.queue.insert(
                            0,
                            QueueEntry {
                                peer: current.peer,
                                allow_replacement: current.allow_replacement,
                                do_not_queue: current.do_not_queue,
                            },
                        );
                    }
                    (RequestNameReply::PrimaryOwner, events)
                } else if do_not_queue {
                    (RequestNameReply::Exists, Vec::new())
                } else if entry.queue.iter().any(|e| e.peer == peer) {
                    (RequestNameReply::InQueue, Vec::new())
                } else {
                    entry.queue.push(QueueEntry {
                        peer,
                        allow_replacement,
                        do_not_queue,
                    });
                    (RequestNameReply::InQueue, Vec::new())
                }
            }
        }
    }

    /// `ReleaseName` (§4.8 / §4.3). Promotes the next queued claimant, if any.
    pub fn release_name(&mut self, name: &str, peer: PeerId) -> (ReleaseNameReply, Vec<NameEvent>) {
        let Some(entry) = self.names.get_mut(name) else {
            return (ReleaseNameReply::NonExistent, Vec::new());
        };

        match entry.primary {
            Some(current) if current.peer == peer => {
                entry.primary = None;
                let mut events = vec![
                    NameEvent::Lost {
                        name: name.to_string(),
                        peer,
                    },
                ];
                if !entry.queue.is_empty() {
                    let next = entry.queue.remove(0);
                    entry.primary = Some(next);
                    events.push(NameEvent::OwnerChanged {
                        name: name.to_string(),
                        old: Some(peer),
                        new: Some(next.peer),
                    });
                    events.push(NameEvent::Acquired {
                        name: name.to_string(),
                        peer: next.peer,
                    });
                } else {
                    events.push(NameEvent::OwnerChanged {
                        name: name.to_string(),
                        old: Some(peer),
                        new: None,
                    });
                }
                if entry.is_empty() {
                    self.names.remove(name);
                }
                (ReleaseNameReply::Released, events)
            }
            _ => {
                let before = entry.queue.len();
                entry.queue.retain(|e| e.peer != peer);
                if entry.queue.len() == before {
                    (ReleaseNameReply::NotOwner, Vec::new())
                } else {
                    (ReleaseNameReply::Released, Vec::new())
                }
            }
        }
    }

    /// Removes every trace of `peer` (disconnect cascade, §4.6 step 2): releases ownership of
    /// every name it held primary and drops it from every queue it was waiting in.
    pub fn drop_peer(&mut self, peer: PeerId) -> Vec<NameEvent> {
        let mut events = Vec::new();
        let names: Vec<String> = self.names.keys().cloned().collect();
        for name in names {
            let entry = self.names.get_mut(&name).expect("just listed");
            if entry.primary.map(|e| e.peer) == Some(peer) {
                let (_, ev) = self.release_name(&name, peer);
                events.extend(ev);
            } else {
                let before = entry.queue.len();
                entry.queue.retain(|e| e.peer != peer);
                if entry.queue.len() != before && entry.is_empty() {
                    self.names.remove(&name);
                }
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_requester_becomes_primary_owner() {
        let mut reg = NameRegistry::new();
        let (reply, events) = reg.request_name("a.b.c", PeerId::new(1), RequestNameFlags::empty());
        assert_eq!(reply, RequestNameReply::PrimaryOwner);
        assert_eq!(events.len(), 2);
        assert_eq!(reg.lookup("a.b.c"), Some(PeerId::new(1)));
    }

    #[test]
    fn second_requester_without_queueing_gets_exists() {
        let mut reg = NameRegistry::new();
        reg.request_name("a.b.c", PeerId::new(1), RequestNameFlags::empty());
        let (reply, events) = reg.request_name(
            "a.b.c",
            PeerId::new(2),
            RequestNameFlag::DoNotQueue,
        );
        assert_eq!(reply, RequestNameReply::Exists);
        assert!(events.is_empty());
    }

    #[test]
    fn second_requester_queues_by_default() {
        let mut reg = NameRegistry::new();
        reg.request_name("a.b.c", PeerId::new(1), RequestNameFlags::empty());
        let (reply, _) = reg.request_name("a.b.c", PeerId::new(2), RequestNameFlags::empty());
        assert_eq!(reply, RequestNameReply::InQueue);
        assert_eq!(reg.queued_owners("a.b.c"), vec![PeerId::new(1), PeerId::new(2)]);
    }

    #[test]
    fn replace_existing_requires_allow_replacement_on_current_owner() {
        let mut reg = NameRegistry::new();
        reg.request_name("a.b.c", PeerId::new(1), RequestNameFlags::empty());
        let (reply, _) = reg.request_name(
            "a.b.c",
            PeerId::new(2),
            RequestNameFlag::ReplaceExisting,
        );
        // peer 1 never allowed replacement, so peer 2 just queues instead.
        assert_eq!(reply, RequestNameReply::InQueue);
        assert_eq!(reg.lookup("a.b.c"), Some(PeerId::new(1)));
    }

    #[test]
    fn replace_existing_succeeds_when_allowed() {
        let mut reg = NameRegistry::new();
        reg.request_name("a.b.c", PeerId::new(1), RequestNameFlag::AllowReplacement);
        let (reply, events) = reg.request_name(
            "a.b.c",
            PeerId::new(2),
            RequestNameFlag::ReplaceExisting,
        );
        assert_eq!(reply, RequestNameReply::PrimaryOwner);
        assert_eq!(reg.lookup("a.b.c"), Some(PeerId::new(2)));
        assert!(events
            .iter()
            .any(|e| matches!(e, NameEvent::Lost { peer, .. } if *peer == PeerId::new(1))));
    }

    #[test]
    fn release_promotes_next_in_queue() {
        let mut reg = NameRegistry::new();
        reg.request_name("a.b.c", PeerId::new(1), RequestNameFlags::empty());
        reg.request_name("a.b.c", PeerId::new(2), RequestNameFlags::empty());
        let (reply, events) = reg.release_name("a.b.c", PeerId::new(1));
        assert_eq!(reply, ReleaseNameReply::Released);
        assert_eq!(reg.lookup("a.b.c"), Some(PeerId::new(2)));
        assert!(events
            .iter()
            .any(|e| matches!(e, NameEvent::Acquired { peer, .. } if *peer == PeerId::new(2))));
    }

    #[test]
    fn drop_peer_cleans_up_ownership_and_queue_membership() {
        let mut reg = NameRegistry::new();
        reg.request_name("a.b.c", PeerId::new(1), RequestNameFlags::empty());
        reg.request_name("a.b.c", PeerId::new(2), RequestNameFlags::empty());
        reg.drop_peer(PeerId::new(1));
        assert_eq!(reg.lookup("a.b.c"), Some(PeerId::new(2)));
        reg.drop_peer(PeerId::new(2));
        assert_eq!(reg.lookup("a.b.c"), None);
    }

    #[test]
    fn replace_existing_drops_demoted_owner_that_held_do_not_queue() {
        let mut reg = NameRegistry::new();
        reg.request_name(
            "a.b.c",
            PeerId::new(1),
            RequestNameFlag::AllowReplacement | RequestNameFlag::DoNotQueue,
        );
        let (reply, _) = reg.request_name(
            "a.b.c",
            PeerId::new(2),
            RequestNameFlag::ReplaceExisting,
        );
        assert_eq!(reply, RequestNameReply::PrimaryOwner);
        assert_eq!(reg.queued_owners("a.b.c"), vec![PeerId::new(2)]);
    }

    #[test]
    fn replace_existing_requeues_demoted_owner_without_do_not_queue() {
        let mut reg = NameRegistry::new();
        reg.request_name("a.b.c", PeerId::new(1), RequestNameFlag::AllowReplacement);
        let (reply, _) = reg.request_name(
            "a.b.c",
            PeerId::new(2),
            RequestNameFlag::ReplaceExisting,
        );
        assert_eq!(reply, RequestNameReply::PrimaryOwner);
        assert_eq!(
            reg.queued_owners("a.b.c"),
            vec![PeerId::new(2), PeerId::new(1)]
        );
    }

    #[test]
    fn validate_requestable_rejects_unique_and_driver_names() {
        assert!(NameRegistry::validate_requestable(":1.5").is_err());
        assert!(NameRegistry::validate_requestable("org.freedesktop.DBus").is_err());
        assert!(NameRegistry::validate_requestable("a.b.c").is_ok());
    }
}
