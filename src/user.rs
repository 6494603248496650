//! Per-UID resource accounting (§4.1).
//!
//! Charges are actor-attributed: when peer A causes resource consumption on peer B (queueing a
//! message into B's outbox), the charge is recorded against A's [`User`] so a flood by A cannot
//! starve B's quota against B's own actions. A [`Charge`] is a move-only token; dropping it
//! without releasing it first is a logic error we catch at debug time rather than silently
//! leaking accounting state, which is why `release` takes the token by value.

use std::collections::HashMap;

use crate::error::{BusError, Result};

/// The UID type used to key per-user accounting. D-Bus peers authenticate with a Unix UID.
pub type Uid = u32;

/// The bounded resources a [`User`] is charged for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// Bytes of queued/outstanding message data.
    Bytes,
    /// Open file descriptors passed in message bodies.
    Fds,
    /// Active match rules.
    Matches,
    /// Peer connections (objects) held open.
    Objects,
    /// Well-known names owned.
    Names,
    /// Outstanding method-call replies.
    Replies,
}

impl SlotKind {
    fn label(self) -> &'static str {
        match self {
            SlotKind::Bytes => "bytes",
            SlotKind::Fds => "fds",
            SlotKind::Matches => "matches",
            SlotKind::Objects => "objects",
            SlotKind::Names => "names",
            SlotKind::Replies => "replies",
        }
    }
}

/// Per-kind resource limits, applied per UID.
///
/// The defaults mirror the values the reference broker ships absent explicit configuration; see
/// `BusConfig` for how these are overridden from the CLI or a config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserLimits {
    pub bytes: u64,
    pub fds: u64,
    pub matches: u64,
    pub objects: u64,
    pub names: u64,
    pub replies: u64,
}

impl Default for UserLimits {
    fn default() -> Self {
        Self {
            bytes: 16 * 1024 * 1024,
            fds: 4096,
            matches: 1024,
            objects: 256,
            names: 256,
            replies: 512,
        }
    }
}

impl UserLimits {
    fn limit_for(&self, slot: SlotKind) -> u64 {
        match slot {
            SlotKind::Bytes => self.bytes,
            SlotKind::Fds => self.fds,
            SlotKind::Matches => self.matches,
            SlotKind::Objects => self.objects,
            SlotKind::Names => self.names,
            SlotKind::Replies => self.replies,
        }
    }
}

/// Per-UID accounting record.
#[derive(Debug, Clone, Default)]
pub struct User {
    uid: Uid,
    limits: UserLimits,
    usage: Usage,
}

#[derive(Debug, Clone, Copy, Default)]
struct Usage {
    bytes: u64,
    fds: u64,
    matches: u64,
    objects: u64,
    names: u64,
    replies: u64,
}

impl Usage {
    fn get(&self, slot: SlotKind) -> u64 {
        match slot {
            SlotKind::Bytes => self.bytes,
            SlotKind::Fds => self.fds,
            SlotKind::Matches => self.matches,
            SlotKind::Objects => self.objects,
            SlotKind::Names => self.names,
            SlotKind::Replies => self.replies,
        }
    }

    fn field_mut(&mut self, slot: SlotKind) -> &mut u64 {
        match slot {
            SlotKind::Bytes => &mut self.bytes,
            SlotKind::Fds => &mut self.fds,
            SlotKind::Matches => &mut self.matches,
            SlotKind::Objects => &mut self.objects,
            SlotKind::Names => &mut self.names,
            SlotKind::Replies => &mut self.replies,
        }
    }
}

impl User {
    fn new(uid: Uid, limits: UserLimits) -> Self {
        Self {
            uid,
            limits,
            usage: Usage::default(),
        }
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn usage(&self, slot: SlotKind) -> u64 {
        self.usage.get(slot)
    }

    pub fn limit(&self, slot: SlotKind) -> u64 {
        self.limits.limit_for(slot)
    }
}

/// A move-only token representing an outstanding reservation against a [`User`]'s quota.
///
/// `Charge` intentionally has no `Drop` impl: forgetting to call [`UserRegistry::release`] is a
/// logic error in the caller (the whole point of the arena-based accounting model is that every
/// registry mutation that allocates quota releases it exactly once, when the object is unlinked),
/// and a silent refund-on-drop would hide that bug instead of surfacing it.
#[derive(Debug)]
#[must_use = "a Charge must be released via UserRegistry::release or it leaks accounted quota"]
pub struct Charge {
    uid: Uid,
    slot: SlotKind,
    amount: u64,
}

impl Charge {
    pub fn slot(&self) -> SlotKind {
        self.slot
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }
}

/// Owns every [`User`] record on the bus, keyed by UID.
#[derive(Debug, Default)]
pub struct UserRegistry {
    users: HashMap<Uid, User>,
    default_limits: UserLimits,
}

impl UserRegistry {
    pub fn new(default_limits: UserLimits) -> Self {
        Self {
            users: HashMap::new(),
            default_limits,
        }
    }

    /// Returns the accounting record for `uid`, creating it with the registry's default limits
    /// if this is the first time this UID has been seen.
    pub fn ref_user(&mut self, uid: Uid) -> &User {
        self.users
            .entry(uid)
            .or_insert_with(|| User::new(uid, self.default_limits))
    }

    pub fn user(&self, uid: Uid) -> Option<&User> {
        self.users.get(&uid)
    }

    /// Attempts to reserve `amount` units of `slot` against `uid`'s quota, attributing the charge
    /// to `uid` regardless of which peer ultimately benefits from the allocation (callers charge
    /// the *actor*, not the recipient, which is what keeps a flooding sender from starving its
    /// victim's own quota).
    ///
    /// On success returns a [`Charge`] that must later be passed to [`Self::release`]. On
    /// failure, no state is changed.
    pub fn charge(&mut self, uid: Uid, slot: SlotKind, amount: u64) -> Result<Charge> {
        let user = self
            .users
            .entry(uid)
            .or_insert_with(|| User::new(uid, self.default_limits));

        let limit = user.limits.limit_for(slot);
        let current = user.usage.get(slot);
        if current.saturating_add(amount) > limit {
            return Err(BusError::Quota { slot: slot.label() });
        }

        *user.usage.field_mut(slot) += amount;
        Ok(Charge { uid, slot, amount })
    }

    /// Refunds a charge. Idempotent only in the sense that the token is consumed by value: a
    /// `Charge` can be released exactly once because releasing it consumes it.
    pub fn release(&mut self, charge: Charge) {
        if let Some(user) = self.users.get_mut(&charge.uid) {
            let field = user.usage.field_mut(charge.slot);
            *field = field.saturating_sub(charge.amount);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_and_release_round_trip() {
        let mut registry = UserRegistry::new(UserLimits {
            matches: 3,
            ..UserLimits::default()
        });

        let c1 = registry.charge(1000, SlotKind::Matches, 1).unwrap();
        let c2 = registry.charge(1000, SlotKind::Matches, 1).unwrap();
        let c3 = registry.charge(1000, SlotKind::Matches, 1).unwrap();
        assert_eq!(registry.user(1000).unwrap().usage(SlotKind::Matches), 3);

        // Fourth charge exceeds the limit and leaves state untouched.
        let err = registry.charge(1000, SlotKind::Matches, 1).unwrap_err();
        assert!(matches!(err, BusError::Quota { slot: "matches" }));
        assert_eq!(registry.user(1000).unwrap().usage(SlotKind::Matches), 3);

        registry.release(c1);
        registry.release(c2);
        registry.release(c3);
        assert_eq!(registry.user(1000).unwrap().usage(SlotKind::Matches), 0);
    }

    #[test]
    fn charges_are_attributed_per_actor() {
        let mut registry = UserRegistry::new(UserLimits::default());

        // Peer 1000 (the actor) queues into peer 2000's (the victim's) outbox; the charge must
        // land on 1000, not 2000.
        let charge = registry.charge(1000, SlotKind::Bytes, 64).unwrap();
        assert_eq!(registry.user(1000).unwrap().usage(SlotKind::Bytes), 64);
        assert_eq!(registry.ref_user(2000).usage(SlotKind::Bytes), 0);

        registry.release(charge);
        assert_eq!(registry.user(1000).unwrap().usage(SlotKind::Bytes), 0);
    }

    #[test]
    fn distinct_users_have_independent_quotas() {
        let mut registry = UserRegistry::new(UserLimits {
            names: 1,
            ..UserLimits::default()
        });

        let _a = registry.charge(1, SlotKind::Names, 1).unwrap();
        // UID 2 has its own quota even though UID 1's is exhausted.
        let _b = registry.charge(2, SlotKind::Names, 1).unwrap();
        assert!(registry.charge(1, SlotKind::Names, 1).is_err());
    }
}
