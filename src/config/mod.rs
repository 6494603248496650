use std::path::Path;

use anyhow::{Error, Result};
use policy::OptionalPolicy;
use serde::Deserialize;

pub mod policy;
pub mod rule;
mod xml;

pub use policy::Policy;
pub use rule::{
    Access, ConnectOperation, NameOwnership, Operation, ReceiveOperation, SendOperation,
};
use xml::{log_unsupported_element, Document, Element};

use crate::{policy::Ruleset, user::UserLimits};

/// Everything [`crate::bus::Bus::bind`] needs out of a parsed [`Config`]: the ruleset built from
/// its `<policy>` elements and the per-user quota limits. Resource `<limit>` elements aren't
/// captured by the XML layer yet (see DESIGN.md), so limits currently come from [`UserLimits`]'s
/// defaults; a config can still override them by constructing this directly.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub limits: UserLimits,
    pub ruleset: Ruleset,
}

impl From<Config> for BusConfig {
    fn from(config: Config) -> Self {
        Self {
            limits: UserLimits::default(),
            ruleset: Ruleset::from_policies(config.policies),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            limits: UserLimits::default(),
            ruleset: Ruleset::from_policies(Vec::new()),
        }
    }
}

/// The parsed form of a `dbus-daemon`-style `<busconfig>` file, trimmed to what this broker
/// actually consumes: the `<policy>` elements that become a [`Ruleset`].
///
/// Listener addresses, authentication mechanisms, forking/daemonizing, syslog, service-activation
/// directories, and UID switching are all out of scope (see SPEC_FULL's Non-goals on service
/// activation and the CLI-driven ambient stack); those elements are recognized by the XML grammar
/// so a stock config file still parses, then discarded.
///
/// [XML configuration files]: https://dbus.freedesktop.org/doc/dbus-daemon.1.html#configuration_file
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Config {
    pub policies: Vec<Policy>,
}

impl TryFrom<Document> for Config {
    type Error = Error;

    fn try_from(value: Document) -> std::result::Result<Self, Self::Error> {
        let mut config = Config::default();

        for element in value.busconfig {
            match element {
                Element::Include(_) => {
                    // NO-OP: removed during `Document::resolve_includes`
                }
                Element::Includedir(_) => {
                    // NO-OP: removed during `Document::resolve_includedirs`
                }
                Element::Limit => {
                    // NO-OP: deprecated and ignored
                }
                Element::Policy(pe) => {
                    if let Some(p) = OptionalPolicy::try_from(pe)? {
                        config.policies.push(p);
                    }
                }
                Element::Unsupported => log_unsupported_element(),
            }
        }

        Ok(config)
    }
}

impl Config {
    pub fn parse(s: &str) -> Result<Self> {
        // TODO: validate that our DOCTYPE and root element are correct
        quick_xml::de::from_str::<Document>(s)?.try_into()
    }

    pub fn read_file(file_path: impl AsRef<Path>) -> Result<Self> {
        // TODO: error message should contain file path to missing `<include>`
        Document::read_file(&file_path)?.try_into()
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    #[serde(rename = "*")]
    Any,
    MethodCall,
    MethodReturn,
    Signal,
    Error,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Name {
    #[serde(rename = "*")]
    Any,
    Exact(String),
    Prefix(String),
}

#[cfg(test)]
mod tests {
    use rule::{
        Access, ConnectOperation, NameOwnership, Operation, ReceiveOperation, SendOperation,
    };

    use super::*;

    #[test]
    fn config_parse_with_dtd_and_root_element_ok() {
        let input = r#"<!DOCTYPE busconfig PUBLIC "-//freedesktop//DTD D-Bus Bus Configuration 1.0//EN"
        "http://www.freedesktop.org/standards/dbus/1.0/busconfig.dtd">
        <busconfig></busconfig>
        "#;
        Config::parse(input).expect("should parse XML input");
    }

    #[test]
    fn config_parse_ignores_elements_outside_the_policy_grammar() {
        let input = r#"<!DOCTYPE busconfig PUBLIC "-//freedesktop//DTD D-Bus Bus Configuration 1.0//EN"
        "http://www.freedesktop.org/standards/dbus/1.0/busconfig.dtd">
        <busconfig>
            <type>session</type>
            <listen>unix:path=/tmp/foo</listen>
            <auth>EXTERNAL</auth>
            <fork/>
            <keep_umask/>
            <syslog/>
            <pidfile>/var/run/busd.pid</pidfile>
            <user>root</user>
            <servicedir>/example</servicedir>
            <servicehelper>/example</servicehelper>
            <standard_session_servicedirs/>
            <standard_system_servicedirs/>
            <allow_anonymous/>
        </busconfig>
        "#;

        let config = Config::parse(input).expect("should parse XML input");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn config_parse_with_limit_ok() {
        let input = r#"<!DOCTYPE busconfig PUBLIC "-//freedesktop//DTD D-Bus Bus Configuration 1.0//EN"
        "http://www.freedesktop.org/standards/dbus/1.0/busconfig.dtd">
        <busconfig>
            <limit name="max_incoming_bytes">1000000000</limit>
        </busconfig>
        "#;

        let config = Config::parse(input).expect("should parse XML input");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn config_parse_with_overlapped_lists_ok() {
        // confirm this works with/without quick-xml's [`overlapped-lists`] feature
        // [`overlapped-lists`]: https://docs.rs/quick-xml/latest/quick_xml/#overlapped-lists
        let input = r#"<!DOCTYPE busconfig PUBLIC "-//freedesktop//DTD D-Bus Bus Configuration 1.0//EN"
        "http://www.freedesktop.org/standards/dbus/1.0/busconfig.dtd">
        <busconfig>
            <auth>ANONYMOUS</auth>
            <listen>unix:path=/tmp/foo</listen>
            <policy context="default">
                <allow own="*"/>
                <deny own="*"/>
                <allow own="*"/>
            </policy>
            <auth>EXTERNAL</auth>
            <listen>tcp:host=localhost,port=1234</listen>
            <policy context="default">
                <deny own="*"/>
                <allow own="*"/>
                <deny own="*"/>
            </policy>
        </busconfig>
        "#;

        let config = Config::parse(input).expect("should parse XML input");

        assert_eq!(
            config,
            Config {
                policies: vec![
                    Policy::DefaultContext(vec![
                        (
                            Access::Allow,
                            Operation::Own(NameOwnership {
                                own: Some(Name::Any)
                            })
                        ),
                        (
                            Access::Deny,
                            Operation::Own(NameOwnership {
                                own: Some(Name::Any)
                            })
                        ),
                        (
                            Access::Allow,
                            Operation::Own(NameOwnership {
                                own: Some(Name::Any)
                            })
                        ),
                    ]),
                    Policy::DefaultContext(vec![
                        (
                            Access::Deny,
                            Operation::Own(NameOwnership {
                                own: Some(Name::Any)
                            })
                        ),
                        (
                            Access::Allow,
                            Operation::Own(NameOwnership {
                                own: Some(Name::Any)
                            })
                        ),
                        (
                            Access::Deny,
                            Operation::Own(NameOwnership {
                                own: Some(Name::Any)
                            })
                        ),
                    ]),
                ],
            }
        );
    }

    #[test]
    fn config_parse_with_policies_ok() {
        let input = r#"<!DOCTYPE busconfig PUBLIC "-//freedesktop//DTD D-Bus Bus Configuration 1.0//EN"
        "http://www.freedesktop.org/standards/dbus/1.0/busconfig.dtd">
        <busconfig>
            <policy context="default">
                <allow own="org.freedesktop.DBus"/>
                <allow own_prefix="org.freedesktop"/>
                <allow group="wheel" />
                <allow user="root" />
            </policy>
            <policy user="root">
                <allow
                    send_broadcast="true"
                    send_destination="org.freedesktop.DBus"
                    send_error="something bad"
                    send_interface="org.freedesktop.systemd1.Activator"
                    send_member="DoSomething"
                    send_path="/org/freedesktop"
                    send_type="signal"
                    max_fds="128"
                    min_fds="12"
                    />
                <allow
                    receive_error="something bad"
                    receive_interface="org.freedesktop.systemd1.Activator"
                    receive_member="DoSomething"
                    receive_path="/org/freedesktop"
                    receive_sender="org.freedesktop.DBus"
                    receive_type="signal"
                    max_fds="128"
                    min_fds="12"
                    />
            </policy>
            <policy group="network">
                <allow send_destination_prefix="org.freedesktop" send_member="DoSomething" />
                <allow receive_sender="org.freedesktop.Avahi" receive_member="DoSomething"/>
            </policy>
            <policy context="mandatory">
                <deny send_destination="net.connman.iwd"/>
            </policy>
        </busconfig>
        "#;

        let config = Config::parse(input).expect("should parse XML input");

        assert_eq!(
            config,
            Config {
                policies: vec![
                    Policy::DefaultContext(vec![
                        (
                            Access::Allow,
                            Operation::Own(NameOwnership {
                                own: Some(Name::Exact(String::from("org.freedesktop.DBus")))
                            })
                        ),
                        (
                            Access::Allow,
                            Operation::Own(NameOwnership {
                                own: Some(Name::Prefix(String::from("org.freedesktop")))
                            })
                        ),
                        (
                            Access::Allow,
                            Operation::Connect(ConnectOperation {
                                group: Some(String::from("wheel")),
                                user: None,
                            })
                        ),
                        (
                            Access::Allow,
                            Operation::Connect(ConnectOperation {
                                group: None,
                                user: Some(String::from("root")),
                            })
                        ),
                    ]),
                    Policy::User(
                        vec![
                            (
                                Access::Allow,
                                Operation::Send(SendOperation {
                                    broadcast: Some(true),
                                    destination: Some(Name::Exact(String::from(
                                        "org.freedesktop.DBus"
                                    ))),
                                    error: Some(String::from("something bad")),
                                    interface: Some(String::from(
                                        "org.freedesktop.systemd1.Activator"
                                    )),
                                    max_fds: Some(128),
                                    member: Some(String::from("DoSomething")),
                                    min_fds: Some(12),
                                    path: Some(String::from("/org/freedesktop")),
                                    r#type: Some(MessageType::Signal),
                                })
                            ),
                            (
                                Access::Allow,
                                Operation::Receive(ReceiveOperation {
                                    error: Some(String::from("something bad")),
                                    interface: Some(String::from(
                                        "org.freedesktop.systemd1.Activator"
                                    )),
                                    max_fds: Some(128),
                                    member: Some(String::from("DoSomething")),
                                    min_fds: Some(12),
                                    path: Some(String::from("/org/freedesktop")),
                                    sender: Some(String::from("org.freedesktop.DBus")),
                                    r#type: Some(MessageType::Signal),
                                })
                            )
                        ],
                        String::from("root")
                    ),
                    Policy::Group(
                        vec![
                            (
                                Access::Allow,
                                Operation::Send(SendOperation {
                                    broadcast: None,
                                    destination: Some(Name::Prefix(String::from(
                                        "org.freedesktop"
                                    ))),
                                    error: None,
                                    interface: None,
                                    max_fds: None,
                                    member: Some(String::from("DoSomething")),
                                    min_fds: None,
                                    path: None,
                                    r#type: None
                                })
                            ),
                            // `<allow send_member=...` should be dropped
                            (
                                Access::Allow,
                                Operation::Receive(ReceiveOperation {
                                    sender: Some(String::from("org.freedesktop.Avahi")),
                                    error: None,
                                    interface: None,
                                    max_fds: None,
                                    member: Some(String::from("DoSomething")),
                                    min_fds: None,
                                    path: None,
                                    r#type: None
                                })
                            ),
                        ],
                        String::from("network")
                    ),
                    Policy::MandatoryContext(vec![(
                        Access::Deny,
                        Operation::Send(SendOperation {
                            broadcast: None,
                            destination: Some(Name::Exact(String::from("net.connman.iwd"))),
                            error: None,
                            interface: None,
                            max_fds: None,
                            member: None,
                            min_fds: None,
                            path: None,
                            r#type: None
                        })
                    ),]),
                ],
            }
        );
    }

    #[should_panic]
    #[test]
    fn config_parse_with_policies_with_group_and_user_error() {
        let input = r#"<!DOCTYPE busconfig PUBLIC "-//freedesktop//DTD D-Bus Bus Configuration 1.0//EN"
        "http://www.freedesktop.org/standards/dbus/1.0/busconfig.dtd">
        <busconfig>
            <policy user="root">
                <allow group="wheel" user="root" />
            </policy>
        </busconfig>
        "#;

        Config::parse(input).expect("should parse XML input");
    }

    #[test]
    fn config_parse_with_policies_with_ignored_rules_and_rule_attributes_ok() {
        let input = r#"<!DOCTYPE busconfig PUBLIC "-//freedesktop//DTD D-Bus Bus Configuration 1.0//EN"
        "http://www.freedesktop.org/standards/dbus/1.0/busconfig.dtd">
        <busconfig>
            <policy context="default">
                <allow send_destination="*" eavesdrop="true"/>
                <allow eavesdrop="true"/>
                <deny eavesdrop="true"/>
                <deny send_requested_reply="true" send_type="method_return"/>
                <allow send_requested_reply="false" send_type="method_return"/>
                <deny receive_requested_reply="true" receive_type="error"/>
                <allow receive_requested_reply="false" receive_type="error"/>
            </policy>
            <policy at_console="true">
                <allow send_destination="org.freedesktop.DBus" send_interface="org.freedesktop.systemd1.Activator"/>
            </policy>
        </busconfig>
        "#;

        let config = Config::parse(input).expect("should parse XML input");

        assert_eq!(
            config,
            Config {
                policies: vec![
                    Policy::DefaultContext(vec![
                        (
                            Access::Allow,
                            // `eavesdrop="true"` is dropped, keep other attributes
                            Operation::Send(SendOperation {
                                broadcast: None,
                                destination: Some(Name::Any),
                                error: None,
                                interface: None,
                                max_fds: None,
                                member: None,
                                min_fds: None,
                                path: None,
                                r#type: None
                            })
                        ),
                        // `<allow eavesdrop="true"/>` has nothing left after dropping eavesdrop
                        // `<deny eavesdrop="true" ...` is completely ignored
                        // `<deny send_requested_reply="true" ...` is completely ignored
                        // `<allow send_requested_reply="false" ...` is completely ignored
                        // `<deny receive_requested_reply="true" ...` is completely ignored
                        // `<allow receive_requested_reply="false" ...` is completely ignored
                    ]),
                    // `<policy at_console="true">` is completely ignored
                ],
            }
        );
    }

    #[should_panic]
    #[test]
    fn config_parse_with_policies_with_own_and_own_prefix_error() {
        let input = r#"<!DOCTYPE busconfig PUBLIC "-//freedesktop//DTD D-Bus Bus Configuration 1.0//EN"
        "http://www.freedesktop.org/standards/dbus/1.0/busconfig.dtd">
        <busconfig>
            <policy user="root">
                <allow own="org.freedesktop.DBus" own_prefix="org.freedesktop" />
            </policy>
        </busconfig>
        "#;

        Config::parse(input).expect("should parse XML input");
    }

    #[should_panic]
    #[test]
    fn config_parse_with_policies_with_send_destination_and_send_destination_prefix_error() {
        let input = r#"<!DOCTYPE busconfig PUBLIC "-//freedesktop//DTD D-Bus Bus Configuration 1.0//EN"
        "http://www.freedesktop.org/standards/dbus/1.0/busconfig.dtd">
        <busconfig>
            <policy user="root">
                <allow send_destination="org.freedesktop.DBus" send_destination_prefix="org.freedesktop" />
            </policy>
        </busconfig>
        "#;

        Config::parse(input).expect("should parse XML input");
    }

    #[should_panic]
    #[test]
    fn config_parse_with_policies_with_send_and_receive_attributes_error() {
        let input = r#"<!DOCTYPE busconfig PUBLIC "-//freedesktop//DTD D-Bus Bus Configuration 1.0//EN"
        "http://www.freedesktop.org/standards/dbus/1.0/busconfig.dtd">
        <busconfig>
            <policy user="root">
                <allow send_destination="org.freedesktop.DBus" receive_sender="org.freedesktop.Avahi" />
            </policy>
        </busconfig>
        "#;

        Config::parse(input).expect("should parse XML input");
    }

    #[should_panic]
    #[test]
    fn config_parse_with_policies_without_attributes_error() {
        let input = r#"<!DOCTYPE busconfig PUBLIC "-//freedesktop//DTD D-Bus Bus Configuration 1.0//EN"
        "http://www.freedesktop.org/standards/dbus/1.0/busconfig.dtd">
        <busconfig>
            <policy user="root">
                <allow />
            </policy>
        </busconfig>
        "#;

        Config::parse(input).expect("should parse XML input");
    }
}
