//! The access-control engine (§4.5).
//!
//! Evaluates a [`Ruleset`] — the parsed form of `<policy>` blocks from the bus configuration —
//! against the four decision points a peer's lifecycle passes through: connecting, owning a name,
//! sending, and receiving. Rules apply in a fixed phase order (`DefaultContext`, `Group`, `User`,
//! `MandatoryContext`); within and across phases the last matching rule wins, except that once a
//! `MandatoryContext` rule denies, no later rule (mandatory or not — there is none later) can
//! override it for this decision.

use crate::{
    config::{
        rule::{Access, ConnectOperation, NameOwnership, Operation, ReceiveOperation, Rule, SendOperation},
        MessageType as ConfigMessageType, Name as ConfigName, Policy,
    },
    match_rule::MessageKind,
    user::Uid,
};

/// The caller-identifying context a decision is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct Identity<'a> {
    pub uid: Uid,
    pub username: Option<&'a str>,
    pub groups: &'a [String],
}

/// What's being sent or received, for `check_send`/`check_receive`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageContext<'a> {
    pub message_type: MessageKind,
    pub interface: Option<&'a str>,
    pub member: Option<&'a str>,
    pub path: Option<&'a str>,
    pub destination: Option<&'a str>,
    pub is_broadcast: bool,
    pub is_reply_to_own_call: bool,
}

/// The parsed, ready-to-evaluate form of every `<policy>` block (§9: Open Question — ambiguous
/// same-context rule ordering resolves to "declaration order within a phase, phases in the fixed
/// DefaultContext → Group → User → MandatoryContext sequence").
#[derive(Debug, Default, Clone)]
pub struct Ruleset {
    default_context: Vec<Rule>,
    groups: Vec<(String, Vec<Rule>)>,
    users: Vec<(String, Vec<Rule>)>,
    mandatory: Vec<Rule>,
}

impl Ruleset {
    pub fn from_policies(policies: Vec<Policy>) -> Self {
        let mut ruleset = Ruleset::default();
        for policy in policies {
            match policy {
                Policy::DefaultContext(rules) => ruleset.default_context.extend(rules),
                Policy::Group(rules, group) => ruleset.groups.push((group, rules)),
                Policy::User(rules, user) => ruleset.users.push((user, rules)),
                Policy::MandatoryContext(rules) => ruleset.mandatory.extend(rules),
            }
        }
        ruleset
    }

    /// Evaluates every phase in order against `matches`, a predicate over one [`Operation`],
    /// applying the last-match-wins / mandatory-deny-is-final rule. Absent any matching rule at
    /// all, the default decision is `Allow` (§4.5).
    fn decide(&self, identity: &Identity<'_>, matches: impl Fn(&Operation) -> bool) -> Access {
        let mut decision = Access::Allow;
        let mut mandatory_denied = false;

        let mut apply = |rules: &[Rule], is_mandatory: bool, mandatory_denied: &mut bool| {
            for (access, op) in rules {
                if *mandatory_denied {
                    break;
                }
                if matches(op) {
                    decision = *access;
                    if is_mandatory && *access == Access::Deny {
                        *mandatory_denied = true;
                    }
                }
            }
        };

        apply(&self.default_context, false, &mut mandatory_denied);
        for (group, rules) in &self.groups {
            if identity.groups.iter().any(|g| g == group) {
                apply(rules, false, &mut mandatory_denied);
            }
        }
        for (user, rules) in &self.users {
            if identity.username == Some(user.as_str()) {
                apply(rules, false, &mut mandatory_denied);
            }
        }
        apply(&self.mandatory, true, &mut mandatory_denied);

        decision
    }
}

fn name_matches(spec: &ConfigName, candidate: &str) -> bool {
    match spec {
        ConfigName::Any => true,
        ConfigName::Exact(n) => n == candidate,
        ConfigName::Prefix(p) => candidate == p || candidate.starts_with(&format!("{p}.")),
    }
}

fn message_type_matches(spec: &ConfigMessageType, actual: MessageKind) -> bool {
    match spec {
        ConfigMessageType::Any => true,
        ConfigMessageType::MethodCall => actual == MessageKind::MethodCall,
        ConfigMessageType::MethodReturn => actual == MessageKind::MethodReturn,
        ConfigMessageType::Signal => actual == MessageKind::Signal,
        ConfigMessageType::Error => actual == MessageKind::Error,
    }
}

fn option_str_matches(spec: &Option<String>, actual: Option<&str>) -> bool {
    match spec {
        None => true,
        Some(s) => actual == Some(s.as_str()),
    }
}

fn connect_matches(op: &ConnectOperation, identity: &Identity<'_>) -> bool {
    if let Some(group) = &op.group {
        return identity.groups.iter().any(|g| g == group);
    }
    if let Some(user) = &op.user {
        return identity.username == Some(user.as_str());
    }
    // A bare `<allow user="*"/>`-less connect rule (neither attribute set) matches everyone; the
    // config loader rejects rules with neither, so this arm is unreachable in practice.
    true
}

fn send_matches(op: &SendOperation, msg: &MessageContext<'_>) -> bool {
    if let Some(broadcast) = op.broadcast {
        if broadcast != msg.is_broadcast {
            return false;
        }
    }
    if let Some(destination) = &op.destination {
        match msg.destination {
            Some(d) if name_matches(destination, d) => (),
            _ => return false,
        }
    }
    if let Some(t) = &op.r#type {
        if !message_type_matches(t, msg.message_type) {
            return false;
        }
    }
    option_str_matches(&op.interface, msg.interface)
        && option_str_matches(&op.member, msg.member)
        && option_str_matches(&op.path, msg.path)
}

fn receive_matches(op: &ReceiveOperation, msg: &MessageContext<'_>, sender: Option<&str>) -> bool {
    if let Some(t) = &op.r#type {
        if !message_type_matches(t, msg.message_type) {
            return false;
        }
    }
    option_str_matches(&op.sender, sender)
        && option_str_matches(&op.interface, msg.interface)
        && option_str_matches(&op.member, msg.member)
        && option_str_matches(&op.path, msg.path)
}

/// Evaluates [`Ruleset`]s against the bus's four decision points.
#[derive(Debug, Default, Clone)]
pub struct PolicyEngine {
    ruleset: Ruleset,
}

impl PolicyEngine {
    pub fn new(ruleset: Ruleset) -> Self {
        Self { ruleset }
    }

    /// `check_connect`: may this identity complete authentication at all?
    pub fn check_connect(&self, identity: &Identity<'_>) -> bool {
        self.ruleset.decide(identity, |op| match op {
            Operation::Connect(c) => connect_matches(c, identity),
            _ => false,
        }) == Access::Allow
    }

    /// `check_own`: may this identity hold primary ownership of `name`?
    pub fn check_own(&self, identity: &Identity<'_>, name: &str) -> bool {
        self.ruleset.decide(identity, |op| match op {
            Operation::Own(NameOwnership { own: Some(spec) }) => name_matches(spec, name),
            _ => false,
        }) == Access::Allow
    }

    /// `check_send`: may this identity send `msg`?
    pub fn check_send(&self, identity: &Identity<'_>, msg: &MessageContext<'_>) -> bool {
        self.ruleset.decide(identity, |op| match op {
            Operation::Send(s) => send_matches(s, msg),
            _ => false,
        }) == Access::Allow
    }

    /// `check_receive`: may this identity (the recipient) receive `msg` from `sender`?
    pub fn check_receive(
        &self,
        identity: &Identity<'_>,
        msg: &MessageContext<'_>,
        sender: Option<&str>,
    ) -> bool {
        self.ruleset.decide(identity, |op| match op {
            Operation::Receive(r) => receive_matches(r, msg, sender),
            _ => false,
        }) == Access::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(uid: Uid, groups: &[String]) -> Identity<'_> {
        Identity {
            uid,
            username: None,
            groups,
        }
    }

    #[test]
    fn default_allow_with_no_matching_rules() {
        let engine = PolicyEngine::new(Ruleset::default());
        let id = identity(1000, &[]);
        assert!(engine.check_own(&id, "com.example.Foo"));
    }

    #[test]
    fn group_rule_overrides_default_context() {
        let ruleset = Ruleset::from_policies(vec![
            Policy::DefaultContext(vec![(
                Access::Allow,
                Operation::Own(NameOwnership {
                    own: Some(ConfigName::Any),
                }),
            )]),
            Policy::Group(
                vec![(
                    Access::Deny,
                    Operation::Own(NameOwnership {
                        own: Some(ConfigName::Prefix("com.example".to_string())),
                    }),
                )],
                "wheel".to_string(),
            ),
        ]);
        let engine = PolicyEngine::new(ruleset);
        let id = identity(1000, &["wheel".to_string()]);
        assert!(!engine.check_own(&id, "com.example.Foo"));
        assert!(engine.check_own(&id, "org.other.Thing"));
    }

    #[test]
    fn mandatory_deny_cannot_be_overridden() {
        let ruleset = Ruleset::from_policies(vec![
            Policy::MandatoryContext(vec![(
                Access::Deny,
                Operation::Own(NameOwnership {
                    own: Some(ConfigName::Exact("org.freedesktop.DBus".to_string())),
                }),
            )]),
        ]);
        let engine = PolicyEngine::new(ruleset);
        let id = identity(0, &[]);
        assert!(!engine.check_own(&id, "org.freedesktop.DBus"));
    }

    #[test]
    fn last_match_wins_within_a_phase() {
        let ruleset = Ruleset::from_policies(vec![Policy::DefaultContext(vec![
            (
                Access::Deny,
                Operation::Own(NameOwnership {
                    own: Some(ConfigName::Any),
                }),
            ),
            (
                Access::Allow,
                Operation::Own(NameOwnership {
                    own: Some(ConfigName::Exact("com.example.Foo".to_string())),
                }),
            ),
        ])]);
        let engine = PolicyEngine::new(ruleset);
        let id = identity(1000, &[]);
        assert!(engine.check_own(&id, "com.example.Foo"));
        assert!(!engine.check_own(&id, "com.example.Bar"));
    }
}
