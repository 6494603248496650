//! The match rule subsystem (§4.2): grammar, indexing, placement, and filter evaluation.
//!
//! A [`MatchRule`] lives in exactly one bus-wide arena (`Bus::match_rules`). Every reference to a
//! rule — from its owner's dedup index, or from the target [`MatchRegistry`] it is linked into —
//! is a plain [`MatchRuleId`], never a pointer; see the "Cyclic references" design note.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use crate::{
    error::{BusError, Result},
    ids::{MatchRuleId, PeerId},
    name_registry::NameRegistry,
};

/// The well-known bus name of the driver, treated specially by rule placement (§4.2).
pub const DRIVER_NAME: &str = "org.freedesktop.DBus";

/// The four D-Bus message types a rule's `type=` key can restrict to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MessageKind {
    Signal,
    MethodCall,
    MethodReturn,
    Error,
}

impl Default for MessageKind {
    fn default() -> Self {
        MessageKind::MethodCall
    }
}

impl MessageKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "signal" => Some(Self::Signal),
            "method_call" => Some(Self::MethodCall),
            "method_return" => Some(Self::MethodReturn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl From<zbus::message::Type> for MessageKind {
    fn from(t: zbus::message::Type) -> Self {
        match t {
            zbus::message::Type::Signal => MessageKind::Signal,
            zbus::message::Type::MethodCall => MessageKind::MethodCall,
            zbus::message::Type::MethodReturn => MessageKind::MethodReturn,
            zbus::message::Type::Error => MessageKind::Error,
        }
    }
}

/// The `sender=` key's value, as written by the subscriber. Placement (§4.2) uses it to pick a
/// target registry, but several placements share one registry with rules that have a different
/// (or no) sender — a not-yet-connected peer's rule sits in the same wildcard registry as a
/// senderless one, for instance — so `MatchKeys::matches` still re-checks it against the filter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SenderSpec {
    Unique(PeerId),
    WellKnown(String),
}

/// The `destination=` key's value. Unlike `sender`, this one *is* consulted at filter-evaluation
/// time, because a given rule's target registry placement has nothing to do with its
/// `destination` key (placement is driven by `sender` only).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DestinationSpec {
    Unique(PeerId),
    WellKnown(String),
}

/// The parsed, canonical key set of one match rule (§4.2 grammar).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MatchKeys {
    pub message_type: Option<MessageKind>,
    pub sender: Option<SenderSpec>,
    pub destination: Option<DestinationSpec>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub path_namespace: Option<String>,
    pub eavesdrop: bool,
    pub arg0namespace: Option<String>,
    pub args: BTreeMap<u8, String>,
    pub arg_paths: BTreeMap<u8, String>,
}

impl MatchKeys {
    /// Parses a D-Bus match rule string (§4.2 grammar) into its canonical key set.
    pub fn parse(rule: &str) -> Result<Self> {
        let mut keys = MatchKeys::default();
        let mut seen_type = false;
        let mut seen_sender = false;
        let mut seen_destination = false;
        let mut seen_interface = false;
        let mut seen_member = false;
        let mut seen_path = false;
        let mut seen_path_ns = false;
        let mut seen_eavesdrop = false;
        let mut seen_arg0ns = false;

        for (key, value) in split_pairs(rule)? {
            match key.as_str() {
                "type" => {
                    reject_dup(&mut seen_type, "type")?;
                    let kind = MessageKind::parse(&value).ok_or_else(|| invalid_rule(
                        format!("unknown message type `{value}`"),
                    ))?;
                    keys.message_type = Some(kind);
                }
                "sender" => {
                    reject_dup(&mut seen_sender, "sender")?;
                    keys.sender = Some(parse_sender(&value));
                }
                "destination" => {
                    reject_dup(&mut seen_destination, "destination")?;
                    keys.destination = Some(parse_destination(&value));
                }
                "interface" => {
                    reject_dup(&mut seen_interface, "interface")?;
                    keys.interface = Some(value);
                }
                "member" => {
                    reject_dup(&mut seen_member, "member")?;
                    keys.member = Some(value);
                }
                "path" => {
                    reject_dup(&mut seen_path, "path")?;
                    keys.path = Some(value);
                }
                "path_namespace" => {
                    reject_dup(&mut seen_path_ns, "path_namespace")?;
                    keys.path_namespace = Some(value);
                }
                "eavesdrop" => {
                    reject_dup(&mut seen_eavesdrop, "eavesdrop")?;
                    keys.eavesdrop = match value.as_str() {
                        "true" => true,
                        "false" => false,
                        _ => {
                            return Err(invalid_rule(format!(
                                "eavesdrop value must be `true` or `false`, got `{value}`"
                            )))
                        }
                    };
                }
                "arg0namespace" => {
                    reject_dup(&mut seen_arg0ns, "arg0namespace")?;
                    keys.arg0namespace = Some(value);
                }
                other => {
                    if let Some(rest) = other.strip_prefix("arg") {
                        if let Some(digits) = rest.strip_suffix("path") {
                            let n = parse_arg_index(digits)?;
                            if keys.arg_paths.insert(n, value).is_some() {
                                return Err(invalid_rule(format!("duplicate key `arg{n}path`")));
                            }
                        } else {
                            let n = parse_arg_index(rest)?;
                            if keys.args.insert(n, value).is_some() {
                                return Err(invalid_rule(format!("duplicate key `arg{n}`")));
                            }
                        }
                    } else {
                        return Err(invalid_rule(format!("unknown match rule key `{other}`")));
                    }
                }
            }
        }

        if keys.path.is_some() && keys.path_namespace.is_some() {
            return Err(invalid_rule(
                "`path` and `path_namespace` cannot both be set".to_string(),
            ));
        }
        if keys.args.contains_key(&0) && keys.arg0namespace.is_some() {
            return Err(invalid_rule(
                "`arg0` and `arg0namespace` cannot both be set".to_string(),
            ));
        }

        Ok(keys)
    }

    /// Whether a message this specific would ever reach a unicast recipient directly (as opposed
    /// to only via eavesdropping); used by [`MatchRegistry`] iteration (§4.2).
    pub fn is_eavesdrop(&self) -> bool {
        self.eavesdrop
    }
}

fn reject_dup(seen: &mut bool, key: &'static str) -> Result<()> {
    if *seen {
        return Err(invalid_rule(format!("duplicate key `{key}`")));
    }
    *seen = true;
    Ok(())
}

fn parse_arg_index(digits: &str) -> Result<u8> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid_rule(format!("invalid arg index `{digits}`")));
    }
    let n: u32 = digits
        .parse()
        .map_err(|_| invalid_rule(format!("invalid arg index `{digits}`")))?;
    if n > 63 {
        return Err(invalid_rule(format!("arg index {n} out of range (0..=63)")));
    }
    Ok(n as u8)
}

fn parse_sender(value: &str) -> SenderSpec {
    if let Some(stripped) = value.strip_prefix(':') {
        // Unique names are of the form `:1.<n>`; we only care about the numeric suffix.
        if let Some(n) = stripped.rsplit('.').next().and_then(|s| s.parse().ok()) {
            return SenderSpec::Unique(PeerId::new(n));
        }
    }
    SenderSpec::WellKnown(value.to_string())
}

fn parse_destination(value: &str) -> DestinationSpec {
    if let Some(stripped) = value.strip_prefix(':') {
        if let Some(n) = stripped.rsplit('.').next().and_then(|s| s.parse().ok()) {
            return DestinationSpec::Unique(PeerId::new(n));
        }
    }
    DestinationSpec::WellKnown(value.to_string())
}

fn invalid_rule(reason: String) -> BusError {
    BusError::Invalid {
        what: "match rule",
        reason,
    }
}

/// Splits a match rule string into `(key, value)` pairs, honoring the quoting grammar in §4.2:
/// values may be single-quoted; inside quotes a backslash is literal; outside quotes `\'` yields
/// `'` and a lone backslash is literal; an unescaped, unquoted comma ends the value.
fn split_pairs(rule: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut chars = rule.chars().peekable();

    loop {
        // Read the key up to `=`.
        let mut key = String::new();
        loop {
            match chars.next() {
                Some('=') => break,
                Some(c) => key.push(c),
                None => {
                    if key.is_empty() && pairs.is_empty() {
                        return Ok(pairs);
                    }
                    return Err(invalid_rule(format!("key `{}` has no value", key.trim())));
                }
            }
        }
        let key = key.trim().to_string();
        if key.is_empty() {
            return Err(invalid_rule("empty key".to_string()));
        }

        // Read the value up to an unquoted, unescaped comma or end of string.
        let mut value = String::new();
        let mut in_quotes = false;
        let mut terminated = false;
        while let Some(&c) = chars.peek() {
            match c {
                '\'' if in_quotes => {
                    in_quotes = false;
                    chars.next();
                }
                '\'' if !in_quotes => {
                    in_quotes = true;
                    chars.next();
                }
                '\\' if in_quotes => {
                    // Literal backslash inside quotes.
                    value.push('\\');
                    chars.next();
                }
                '\\' if !in_quotes => {
                    chars.next();
                    match chars.peek() {
                        Some('\'') => {
                            value.push('\'');
                            chars.next();
                        }
                        _ => value.push('\\'),
                    }
                }
                ',' if !in_quotes => {
                    chars.next();
                    terminated = true;
                    break;
                }
                _ => {
                    value.push(c);
                    chars.next();
                }
            }
        }
        if in_quotes {
            return Err(invalid_rule("unterminated quoted value".to_string()));
        }
        pairs.push((key, value.trim().to_string()));
        if !terminated {
            return Ok(pairs);
        }
    }
}

/// The already-resolved context of a message being routed, against which [`MatchKeys`] are
/// evaluated. `sender`/`destination` are concrete peer IDs: resolving a well-known name to its
/// current owner is the router's job (it has the [`NameRegistry`]), not this module's.
#[derive(Debug, Clone)]
pub struct Filter<'a> {
    pub message_type: MessageKind,
    pub sender: PeerId,
    /// `None` for signals and other non-addressed messages.
    pub destination: Option<PeerId>,
    pub interface: Option<&'a str>,
    pub member: Option<&'a str>,
    pub path: Option<&'a str>,
    pub args: &'a BTreeMap<u8, String>,
}

impl Filter<'_> {
    /// A unicast filter is one with a destination set; per §4.2, only `eavesdrop` rules may match
    /// a unicast filter (plain subscriptions only ever see broadcasts).
    pub fn is_unicast(&self) -> bool {
        self.destination.is_some()
    }
}

impl MatchKeys {
    /// Evaluates this rule's keys against a message [`Filter`]. `names` is needed only to resolve
    /// a `destination=<well-known-name>` key, since the filter itself carries only peer IDs.
    pub fn matches(&self, filter: &Filter<'_>, names: &NameRegistry) -> bool {
        if let Some(kind) = self.message_type {
            if kind != filter.message_type {
                return false;
            }
        }
        if let Some(sender_spec) = &self.sender {
            let matches = match sender_spec {
                SenderSpec::Unique(id) => *id == filter.sender,
                SenderSpec::WellKnown(name) => names.lookup(name) == Some(filter.sender),
            };
            if !matches {
                return false;
            }
        }
        if let Some(dest_spec) = &self.destination {
            let Some(filter_dest) = filter.destination else {
                return false;
            };
            let matches = match dest_spec {
                DestinationSpec::Unique(id) => *id == filter_dest,
                DestinationSpec::WellKnown(name) => names.lookup(name) == Some(filter_dest),
            };
            if !matches {
                return false;
            }
        }
        if let Some(iface) = &self.interface {
            if filter.interface != Some(iface.as_str()) {
                return false;
            }
        }
        if let Some(member) = &self.member {
            if filter.member != Some(member.as_str()) {
                return false;
            }
        }
        if let Some(path) = &self.path {
            if filter.path != Some(path.as_str()) {
                return false;
            }
        }
        if let Some(ns) = &self.path_namespace {
            match filter.path {
                Some(p) if namespace_prefix_matches(ns, p, '/') => (),
                _ => return false,
            }
        }
        if let Some(ns) = &self.arg0namespace {
            match filter.args.get(&0) {
                Some(arg0) if namespace_prefix_matches(ns, arg0, '.') => (),
                _ => return false,
            }
        }
        for (n, expected) in &self.args {
            if filter.args.get(n) != Some(expected) {
                return false;
            }
        }
        for (n, expected) in &self.arg_paths {
            match filter.args.get(n) {
                Some(actual) if path_prefix_matches_either_way(expected, actual) => (),
                _ => return false,
            }
        }
        true
    }
}

/// `path_namespace`/`arg0namespace` semantics: `prefix` must equal `value`, or be a prefix of it
/// that ends exactly on a `delim` boundary (or `value` must end exactly at the end of `prefix`).
fn namespace_prefix_matches(prefix: &str, value: &str, delim: char) -> bool {
    if prefix == value {
        return true;
    }
    if let Some(rest) = value.strip_prefix(prefix) {
        return rest.starts_with(delim);
    }
    false
}

/// `argNpath` semantics: a bidirectional, `/`-aligned prefix match — either the rule's value is a
/// directory-style prefix of the message's value, or vice versa.
fn path_prefix_matches_either_way(rule_value: &str, msg_value: &str) -> bool {
    directory_prefix(rule_value, msg_value) || directory_prefix(msg_value, rule_value)
}

fn directory_prefix(prefix: &str, value: &str) -> bool {
    if prefix == value {
        return true;
    }
    let prefix_slashed = if prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    };
    value.starts_with(&prefix_slashed)
}

/// Where a [`MatchRule`] has been linked, computed from its `sender` key at link time (§4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// No sender specified.
    Wildcard,
    /// `sender=org.freedesktop.DBus`.
    Driver,
    /// `sender=:1.<n>` for a currently-connected peer.
    Peer(PeerId),
    /// `sender=<well-known-name>`, linked into that name's own registry. Holds one extra
    /// reference on the name which must be released when the rule is unlinked.
    Name(String),
    /// `sender=:1.<n>` for an `n` at or above `next_peer_id`: the peer may connect later, so the
    /// rule is parked in the wildcard registry with its numeric sender filter intact.
    WildcardPendingPeer,
    /// `sender=:1.<n>` for an `n` below the high-water mark but no peer currently has it: this
    /// rule can never fire. Still tracked in the owner's index, but linked nowhere.
    NeverFiring,
    /// Reassigned here by `Bus::become_monitor` (§4.6): the owner became a monitor, so the rule
    /// moved out of whatever registry its `sender=` key originally placed it in and into the
    /// bus-wide monitor registry, always linked with `eavesdrop=true`.
    Monitor,
}

/// One parsed, linked subscription.
#[derive(Debug)]
pub struct MatchRule {
    id: MatchRuleId,
    keys: MatchKeys,
    raw: String,
    owner: PeerId,
    refcount: u32,
    placement: Placement,
    /// The `Matches` quota charge this rule holds against its owner's UID, released when the
    /// rule's refcount drops to zero (`RemoveMatch`/disconnect cascade).
    charge: Option<crate::user::Charge>,
}

impl MatchRule {
    pub fn id(&self) -> MatchRuleId {
        self.id
    }

    pub fn keys(&self) -> &MatchKeys {
        &self.keys
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn owner(&self) -> PeerId {
        self.owner
    }

    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    pub fn is_eavesdrop(&self) -> bool {
        self.keys.is_eavesdrop()
    }

    pub fn set_charge(&mut self, charge: crate::user::Charge) {
        self.charge = Some(charge);
    }

    pub fn take_charge(&mut self) -> Option<crate::user::Charge> {
        self.charge.take()
    }

    /// A `Copy`-free but cheaply cloned snapshot of the fields a caller needs to unlink this rule
    /// from its target registry, without holding a borrow of the arena.
    pub fn placement_snapshot(&self) -> (MatchRuleId, Placement, bool) {
        (self.id, self.placement.clone(), self.is_eavesdrop())
    }
}

/// A snapshot of a removed rule's routing-relevant fields, returned by [`MatchRules::remove`] and
/// [`MatchRules::drop_all_owned_by`] so the caller can unlink it from its target registry and
/// release its charge without the arena entry still being borrowed.
pub struct RemovedRule {
    pub id: MatchRuleId,
    pub placement: Placement,
    pub charge: Option<crate::user::Charge>,
}

/// The target list a linked, non-monitor rule is appended to, beyond its eavesdrop-ness.
#[derive(Debug, Default, Clone)]
pub struct MatchRegistry {
    rule_list: Vec<MatchRuleId>,
    eavesdrop_list: Vec<MatchRuleId>,
}

impl MatchRegistry {
    pub fn link(&mut self, id: MatchRuleId, eavesdrop: bool) {
        if eavesdrop {
            self.eavesdrop_list.push(id);
        } else {
            self.rule_list.push(id);
        }
    }

    pub fn unlink(&mut self, id: MatchRuleId) {
        self.rule_list.retain(|&r| r != id);
        self.eavesdrop_list.retain(|&r| r != id);
    }

    pub fn is_empty(&self) -> bool {
        self.rule_list.is_empty() && self.eavesdrop_list.is_empty()
    }

    /// Iterates candidate rule IDs in the order `next_match` requires: eavesdrop list first, then
    /// (for non-unicast filters only) the plain rule list.
    pub fn candidates(&self, unicast: bool) -> impl Iterator<Item = MatchRuleId> + '_ {
        let rest: &[MatchRuleId] = if unicast { &[] } else { &self.rule_list };
        self.eavesdrop_list.iter().chain(rest).copied()
    }
}

/// The bus-wide arena of match rules, plus each owner's dedup index.
///
/// This is the "MatchOwner owns the rule; a target registry's entry is a secondary linkage"
/// structure from the design notes: `rules` is the sole owner of `MatchRule` values, `by_owner`
/// is the per-subscriber dedup index keyed by canonical [`MatchKeys`], and the actual
/// [`MatchRegistry`] lists (wildcard/driver/per-peer/per-name) are stored by the caller (`Bus`,
/// `Peer`, `Name`) and merely hold [`MatchRuleId`]s.
#[derive(Debug, Default)]
pub struct MatchRules {
    rules: std::collections::HashMap<MatchRuleId, MatchRule>,
    by_owner: std::collections::HashMap<PeerId, BTreeMap<MatchKeys, MatchRuleId>>,
    next_id: crate::ids::Counter,
}

/// The outcome of adding a rule: either it was brand new (the caller must link it into a
/// registry) or it coalesced with an existing one (refcount bumped, nothing to link).
pub enum AddOutcome {
    New(MatchRuleId),
    Coalesced(MatchRuleId),
}

impl MatchRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: MatchRuleId) -> Option<&MatchRule> {
        self.rules.get(&id)
    }

    /// Parses and indexes a rule under `owner`, coalescing with an existing identical
    /// subscription by incrementing its refcount instead of creating a duplicate (§4.2).
    ///
    /// On [`AddOutcome::New`] the caller still must call [`Self::set_placement`] to link the rule
    /// into the right target registry.
    pub fn add(&mut self, owner: PeerId, raw: &str) -> Result<AddOutcome> {
        let keys = MatchKeys::parse(raw)?;
        let owner_index = self.by_owner.entry(owner).or_default();
        if let Some(&existing) = owner_index.get(&keys) {
            let rule = self.rules.get_mut(&existing).expect("index/arena desync");
            rule.refcount += 1;
            return Ok(AddOutcome::Coalesced(existing));
        }

        let id = MatchRuleId::new(self.next_id.next());
        owner_index.insert(keys.clone(), id);
        self.rules.insert(
            id,
            MatchRule {
                id,
                keys,
                raw: raw.to_string(),
                owner,
                refcount: 1,
                placement: Placement::Wildcard,
                charge: None,
            },
        );
        Ok(AddOutcome::New(id))
    }

    pub fn set_placement(&mut self, id: MatchRuleId, placement: Placement) {
        if let Some(rule) = self.rules.get_mut(&id) {
            rule.placement = placement;
        }
    }

    /// Gives `add_match` a way to stash the `Matches` quota charge onto the just-inserted rule
    /// without re-fetching through a cloned key.
    pub fn get_mut(&mut self, id: MatchRuleId) -> Option<&mut MatchRule> {
        self.rules.get_mut(&id)
    }

    /// Removes the first rule owned by `owner` whose raw form parses to keys matching `raw`,
    /// decrementing its refcount and only actually dropping it (returning `Some`) once the count
    /// reaches zero. Mirrors `RemoveMatch`'s "removes the first rule that matches" contract.
    pub fn remove(&mut self, owner: PeerId, raw: &str) -> Result<Option<RemovedRule>> {
        let keys = MatchKeys::parse(raw)?;
        let Some(owner_index) = self.by_owner.get_mut(&owner) else {
            return Err(BusError::NotFound("no such match rule".to_string()));
        };
        let Some(&id) = owner_index.get(&keys) else {
            return Err(BusError::NotFound("no such match rule".to_string()));
        };
        let rule = self.rules.get_mut(&id).expect("index/arena desync");
        rule.refcount -= 1;
        if rule.refcount == 0 {
            owner_index.remove(&keys);
            let mut rule = self.rules.remove(&id).expect("checked above");
            Ok(Some(RemovedRule {
                id,
                placement: rule.placement.clone(),
                charge: rule.take_charge(),
            }))
        } else {
            Ok(None)
        }
    }

    /// Drops every rule owned by `owner` unconditionally (disconnect cascade, §4.6 step 5).
    /// Returns the dropped rules so the caller can unlink them from their target registries and
    /// release any `Name` references they pinned.
    pub fn drop_all_owned_by(&mut self, owner: PeerId) -> Vec<RemovedRule> {
        let Some(owner_index) = self.by_owner.remove(&owner) else {
            return Vec::new();
        };
        owner_index
            .into_values()
            .filter_map(|id| self.rules.remove(&id))
            .map(|mut rule| RemovedRule {
                id: rule.id,
                placement: rule.placement.clone(),
                charge: rule.take_charge(),
            })
            .collect()
    }

    /// Returns every rule ID currently owned by `owner`, for `become_monitor`'s reassignment step.
    pub fn owned_by(&self, owner: PeerId) -> Vec<MatchRuleId> {
        self.by_owner
            .get(&owner)
            .map(|idx| idx.values().copied().collect())
            .unwrap_or_default()
    }
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Resolves a rule's `sender` key against live bus state to decide its [`Placement`] (§4.2).
pub fn resolve_placement(
    sender: Option<&SenderSpec>,
    peer_exists: impl Fn(PeerId) -> bool,
    next_peer_id: PeerId,
) -> Placement {
    match sender {
        None => Placement::Wildcard,
        Some(SenderSpec::WellKnown(name)) if name == DRIVER_NAME => Placement::Driver,
        Some(SenderSpec::WellKnown(name)) => Placement::Name(name.clone()),
        Some(SenderSpec::Unique(id)) => {
            if peer_exists(*id) {
                Placement::Peer(*id)
            } else if id.as_u64() >= next_peer_id.as_u64() {
                Placement::WildcardPendingPeer
            } else {
                Placement::NeverFiring
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_rule() {
        let keys = MatchKeys::parse("type='signal',sender='org.freedesktop.DBus'").unwrap();
        assert_eq!(keys.message_type, Some(MessageKind::Signal));
        assert_eq!(
            keys.sender,
            Some(SenderSpec::WellKnown("org.freedesktop.DBus".to_string()))
        );
    }

    #[test]
    fn unquoted_comma_terminates_value_quoted_does_not() {
        let keys = MatchKeys::parse(r"member='a,b',interface='x'").unwrap();
        assert_eq!(keys.member.as_deref(), Some("a,b"));
        assert_eq!(keys.interface.as_deref(), Some("x"));
    }

    #[test]
    fn escaped_quote_outside_quotes_yields_literal_quote() {
        let keys = MatchKeys::parse(r"member=a\'b").unwrap();
        assert_eq!(keys.member.as_deref(), Some("a'b"));
    }

    #[test]
    fn backslash_inside_quotes_is_literal() {
        let keys = MatchKeys::parse(r"member='a\b'").unwrap();
        assert_eq!(keys.member.as_deref(), Some(r"a\b"));
    }

    #[test]
    fn unterminated_quote_is_invalid() {
        assert!(MatchKeys::parse("member='unterminated").is_err());
    }

    #[test]
    fn path_and_path_namespace_conflict() {
        assert!(MatchKeys::parse("path=/a,path_namespace=/a").is_err());
    }

    #[test]
    fn arg0_and_arg0namespace_conflict() {
        assert!(MatchKeys::parse("arg0=foo,arg0namespace=bar").is_err());
    }

    #[test]
    fn arg63path_accepted_arg64path_rejected() {
        assert!(MatchKeys::parse("arg63path=/foo").is_ok());
        assert!(MatchKeys::parse("arg64path=/foo").is_err());
    }

    #[test]
    fn unknown_type_rejected() {
        assert!(MatchKeys::parse("type=bogus").is_err());
    }

    #[test]
    fn duplicate_key_rejected() {
        assert!(MatchKeys::parse("member=a,member=b").is_err());
    }

    #[test]
    fn round_trips_at_key_level() {
        let a = MatchKeys::parse("type='signal',interface='a.b',member='c',path='/a/b'").unwrap();
        let formatted = format!(
            "type='{}',interface='{}',member='{}',path='{}'",
            "signal", "a.b", "c", "/a/b"
        );
        let b = MatchKeys::parse(&formatted).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn path_namespace_prefix_matching() {
        assert!(namespace_prefix_matches("/a/b", "/a/b", '/'));
        assert!(namespace_prefix_matches("/a/b", "/a/b/c", '/'));
        assert!(!namespace_prefix_matches("/a/b", "/a/bc", '/'));
    }

    #[test]
    fn arg_path_bidirectional_prefix() {
        assert!(path_prefix_matches_either_way("/foo/bar", "/foo/bar/baz"));
        assert!(path_prefix_matches_either_way("/foo/bar/baz", "/foo/bar"));
        assert!(!path_prefix_matches_either_way("/foo/barbaz", "/foo/bar"));
    }
}
