//! Outstanding method-call tracking (§4.4).
//!
//! Every method call without the `NO_REPLY_EXPECTED` flag opens a [`ReplySlot`] keyed by
//! `(caller, serial)`. The slot charges one `Replies` unit against the callee's UID — the
//! recipient who must answer — so a flood of calls from many distinct callers into one slow
//! recipient is bounded by that recipient's own quota instead of spreading the cost across
//! whichever UID happened to place each call.

use std::collections::HashMap;

use zbus::Message;

use crate::{
    error::{BusError, Result},
    ids::PeerId,
    user::{Charge, SlotKind, UserRegistry, Uid},
};

/// One outstanding method call awaiting a reply.
pub struct ReplySlot {
    caller: PeerId,
    callee: PeerId,
    serial: u32,
    charge: Charge,
    /// The original call, kept so a `Disconnected` error can be built as a proper reply to it
    /// (§4.6 step 4) if the callee vanishes before answering.
    call: Message,
}

impl ReplySlot {
    pub fn caller(&self) -> PeerId {
        self.caller
    }

    pub fn callee(&self) -> PeerId {
        self.callee
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }
}

/// Tracks every outstanding call, indexed by `(caller, serial)` for reply lookup and by `callee`
/// for the disconnect cascade (§4.6 step 4: synthesize `Disconnected` errors back to callers).
#[derive(Default)]
pub struct ReplyRegistry {
    by_caller_serial: HashMap<(PeerId, u32), ReplySlot>,
}

impl ReplyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new outstanding call, charging one `Replies` unit against `callee_uid`.
    pub fn open(
        &mut self,
        users: &mut UserRegistry,
        caller: PeerId,
        callee_uid: Uid,
        callee: PeerId,
        serial: u32,
        call: Message,
    ) -> Result<()> {
        let key = (caller, serial);
        if self.by_caller_serial.contains_key(&key) {
            return Err(BusError::Exists(format!(
                "a call with serial {serial} from {caller} is already outstanding"
            )));
        }
        let charge = users.charge(callee_uid, SlotKind::Replies, 1)?;
        self.by_caller_serial.insert(
            key,
            ReplySlot {
                caller,
                callee,
                serial,
                charge,
                call,
            },
        );
        Ok(())
    }

    /// Resolves an incoming reply (`method_return` or `error`) against its outstanding call.
    ///
    /// `from` is the reply message's sender, `to` its destination, `reply_serial` its
    /// `reply_serial` header field. Returns the matched slot's caller for routing, after
    /// releasing its charge. An [`BusError::UnexpectedReply`] means the reply's sender doesn't
    /// match who the call was actually sent to (or there's no such outstanding call at all) and
    /// the replying peer should be disconnected for a protocol violation.
    pub fn resolve(
        &mut self,
        users: &mut UserRegistry,
        from: PeerId,
        to: PeerId,
        reply_serial: u32,
    ) -> Result<PeerId> {
        let key = (to, reply_serial);
        let Some(slot) = self.by_caller_serial.get(&key) else {
            return Err(BusError::UnexpectedReply {
                sender: zbus::names::OwnedUniqueName::try_from(from.to_unique_name())
                    .expect("PeerId::to_unique_name is always a valid unique name"),
                serial: reply_serial,
            });
        };
        if slot.callee != from {
            return Err(BusError::UnexpectedReply {
                sender: zbus::names::OwnedUniqueName::try_from(from.to_unique_name())
                    .expect("PeerId::to_unique_name is always a valid unique name"),
                serial: reply_serial,
            });
        }
        let slot = self.by_caller_serial.remove(&key).expect("checked above");
        users.release(slot.charge);
        Ok(slot.caller)
    }

    /// Drops every slot owned by `caller` (its disconnect cascade): the calls simply vanish,
    /// since there's no one left to deliver their replies to.
    pub fn drop_caller(&mut self, users: &mut UserRegistry, caller: PeerId) {
        let keys: Vec<_> = self
            .by_caller_serial
            .keys()
            .filter(|(c, _)| *c == caller)
            .copied()
            .collect();
        for key in keys {
            if let Some(slot) = self.by_caller_serial.remove(&key) {
                users.release(slot.charge);
            }
        }
    }

    /// Removes and returns every slot whose callee is `callee` (the callee just disconnected): the
    /// caller of each must be synthesized a `Disconnected` error reply (§4.6 step 4).
    pub fn take_pending_for_callee(
        &mut self,
        users: &mut UserRegistry,
        callee: PeerId,
    ) -> Vec<(PeerId, u32, Message)> {
        let keys: Vec<_> = self
            .by_caller_serial
            .iter()
            .filter(|(_, slot)| slot.callee == callee)
            .map(|(k, _)| *k)
            .collect();
        let mut result = Vec::with_capacity(keys.len());
        for key in keys {
            let slot = self.by_caller_serial.remove(&key).expect("just listed");
            users.release(slot.charge);
            result.push((slot.caller, slot.serial, slot.call));
        }
        result
    }
}
