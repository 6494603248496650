use anyhow::Error;
use serde::Deserialize;

use super::{
    rule::{rules_try_from_rule_elements, Rule},
    xml::{PolicyContext, PolicyElement},
};

/// One `<policy>` block, carrying the phase [`crate::policy::Ruleset::decide`] evaluates it under.
/// `at_console` policies have no bearing on a UNIX-socket-only broker and are dropped at parse
/// time (see [`OptionalPolicy`]'s `TryFrom` impl), so this enum only ever holds the four phases
/// `PolicyEngine` actually applies.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub enum Policy {
    DefaultContext(Vec<Rule>),
    Group(Vec<Rule>, String),
    MandatoryContext(Vec<Rule>),
    User(Vec<Rule>, String),
}

pub type OptionalPolicy = Option<Policy>;

impl TryFrom<PolicyElement> for OptionalPolicy {
    type Error = Error;

    fn try_from(value: PolicyElement) -> std::result::Result<Self, Self::Error> {
        let PolicyElement {
            at_console,
            context,
            group,
            rules,
            user,
        } = value;

        match (at_console, context, group, user) {
            (Some(_), None, None, None) => Ok(None),
            (None, Some(c), None, None) => {
                let rules = rules_try_from_rule_elements(rules)?;
                Ok(Some(match c {
                    PolicyContext::Default => Policy::DefaultContext(rules),
                    PolicyContext::Mandatory => Policy::MandatoryContext(rules),
                }))
            }
            (None, None, Some(group), None) => {
                Ok(Some(Policy::Group(rules_try_from_rule_elements(rules)?, group)))
            }
            (None, None, None, Some(user)) => {
                Ok(Some(Policy::User(rules_try_from_rule_elements(rules)?, user)))
            }
            (at_console, context, group, user) => Err(Error::msg(format!(
                "policy contains conflicting attributes: at_console={at_console:?} context={context:?} group={group:?} user={user:?}"
            ))),
        }
    }
}
