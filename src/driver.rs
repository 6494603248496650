//! The bus driver: the `org.freedesktop.DBus` pseudo-peer every connection addresses for
//! `Hello`/`RequestName`/`AddMatch`/etc (§4.8), plus the wire-signal side of name ownership
//! changes (§4.3).
//!
//! This crate routes raw [`Message`]s rather than dispatching through `zbus::ObjectServer`, so
//! the driver's method surface is hand-dispatched on `interface`/`member` instead of expanded
//! from a `#[dbus_interface]` trait impl. The method list and wire behavior still mirror
//! `org.freedesktop.DBus` as specified.

use std::collections::HashMap;

use tracing::warn;
use zbus::{zvariant::Value, DBusError, Message};

use crate::{
    bus::Bus,
    error::{BusError, Result},
    ids::{PeerId, DRIVER_PEER_ID},
    match_rule::DRIVER_NAME,
    name_registry::{NameEvent, NameRegistry, RequestNameFlags},
    peer::{Peer, PeerState},
    policy::Identity,
    user::SlotKind,
};

const PATH: &str = "/org/freedesktop/DBus";
const INTERFACE: &str = DRIVER_NAME;
const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
const MONITORING_INTERFACE: &str = "org.freedesktop.DBus.Monitoring";

/// Entry point for any method call addressed to `org.freedesktop.DBus` (§4.8). Builds and
/// enqueues the reply (or error reply) itself; only returns `Err` when the caller must be
/// disconnected (a [`BusError::disconnects_peer`] kind).
pub(crate) async fn handle_call(
    bus: &mut Bus,
    sender: PeerId,
    msg: &Message,
    reply_expected: bool,
) -> Result<()> {
    let header = msg.header();
    let interface = header.interface().map(|i| i.as_str());
    let member = header.member().map(|m| m.as_str()).unwrap_or_default();

    if interface == Some(PROPERTIES_INTERFACE) {
        if let Err(err) = handle_properties(bus, sender, msg, reply_expected) {
            if reply_expected {
                reply_err(bus, sender, msg, &err);
            }
            return if err.disconnects_peer() { Err(err) } else { Ok(()) };
        }
        return Ok(());
    }
    if interface == Some(MONITORING_INTERFACE) || member == "BecomeMonitor" {
        let result = handle_become_monitor(bus, sender, msg);
        return finish(bus, sender, msg, reply_expected, result);
    }

    match member {
        "Hello" => {
            let result = handle_hello(bus, sender, msg).await;
            finish(bus, sender, msg, reply_expected, result)
        }
        "RequestName" => {
            let result = handle_request_name(bus, sender, msg).await;
            finish(bus, sender, msg, reply_expected, result)
        }
        "ReleaseName" => {
            let result = handle_release_name(bus, sender, msg).await;
            finish(bus, sender, msg, reply_expected, result)
        }
        "AddMatch" => {
            let result = handle_add_match(bus, sender, msg);
            finish(bus, sender, msg, reply_expected, result)
        }
        "RemoveMatch" => {
            let result = handle_remove_match(bus, sender, msg);
            finish(bus, sender, msg, reply_expected, result)
        }
        "GetNameOwner" => {
            let result = handle_get_name_owner(bus, msg);
            finish(bus, sender, msg, reply_expected, result)
        }
        "ListNames" => {
            let result: Result<Vec<String>> = Ok(list_names(bus));
            finish(bus, sender, msg, reply_expected, result)
        }
        "ListActivatableNames" => {
            let result: Result<Vec<String>> = Ok(Vec::new());
            finish(bus, sender, msg, reply_expected, result)
        }
        "ListQueuedOwners" => {
            let result = handle_list_queued_owners(bus, msg);
            finish(bus, sender, msg, reply_expected, result)
        }
        "NameHasOwner" => {
            let result = handle_name_has_owner(bus, msg);
            finish(bus, sender, msg, reply_expected, result)
        }
        "GetConnectionUnixProcessID" => {
            let result = handle_get_connection_unix_process_id(bus, msg);
            finish(bus, sender, msg, reply_expected, result)
        }
        "GetConnectionUnixUser" => {
            let result = handle_get_connection_unix_user(bus, msg);
            finish(bus, sender, msg, reply_expected, result)
        }
        "GetConnectionCredentials" => {
            let result = handle_get_connection_credentials(bus, msg);
            finish(bus, sender, msg, reply_expected, result)
        }
        "GetAdtAuditSessionData" => {
            let result: Result<Vec<u8>> = Err(BusError::Refused("Solaris really?".to_string()));
            finish(bus, sender, msg, reply_expected, result)
        }
        "GetConnectionSELinuxSecurityContext" => {
            let result: Result<Vec<u8>> = Err(BusError::Refused(
                "SELinux security contexts are not supported".to_string(),
            ));
            finish(bus, sender, msg, reply_expected, result)
        }
        "StartServiceByName" => {
            let result: Result<u32> =
                Err(BusError::Refused("service activation is not supported".to_string()));
            finish(bus, sender, msg, reply_expected, result)
        }
        "UpdateActivationEnvironment" => {
            let result: Result<()> =
                Err(BusError::Refused("service activation is not supported".to_string()));
            finish(bus, sender, msg, reply_expected, result)
        }
        "ReloadConfig" => {
            let result: Result<()> =
                Err(BusError::Refused("no server configuration to reload".to_string()));
            finish(bus, sender, msg, reply_expected, result)
        }
        "GetId" => {
            let result: Result<String> = Ok(bus.guid.to_string());
            finish(bus, sender, msg, reply_expected, result)
        }
        other => {
            let result: Result<()> = Err(BusError::NotFound(format!("unknown method `{other}`")));
            finish(bus, sender, msg, reply_expected, result)
        }
    }
}

/// Centralizes the reply-or-error-reply decision every driver method shares: build a
/// `method_return` from `Ok(body)`, or an `org.freedesktop.DBus.Error.*` reply from `Err`, and
/// hand the disconnect decision back up to `Bus::route_message`/`handle_receive`.
fn finish<T>(
    bus: &mut Bus,
    sender: PeerId,
    call: &Message,
    reply_expected: bool,
    result: Result<T>,
) -> Result<()>
where
    T: serde::Serialize + zbus::zvariant::Type,
{
    match result {
        Ok(body) => {
            if reply_expected {
                reply_ok(bus, sender, call, &body);
            }
            Ok(())
        }
        Err(err) => {
            if reply_expected {
                reply_err(bus, sender, call, &err);
            }
            if err.disconnects_peer() {
                Err(err)
            } else {
                Ok(())
            }
        }
    }
}

fn reply_ok<T>(bus: &mut Bus, to: PeerId, call: &Message, body: &T)
where
    T: serde::Serialize + zbus::zvariant::Type,
{
    let built = zbus::message::Builder::method_return(&call.header()).and_then(|b| b.build(body));
    match built {
        Ok(msg) => enqueue(bus, to, msg),
        Err(e) => warn!("failed to build driver reply: {e}"),
    }
}

fn reply_err(bus: &mut Bus, to: PeerId, call: &Message, err: &BusError) {
    match err.wire_error().create_reply(&call.header()) {
        Ok(msg) => enqueue(bus, to, msg),
        Err(e) => warn!("failed to build driver error reply: {e}"),
    }
}

fn enqueue(bus: &mut Bus, to: PeerId, msg: Message) {
    if let Some(peer) = bus.peers.get_mut(&to) {
        peer.enqueue(msg);
    }
}

fn body_as<T>(msg: &Message) -> Result<T>
where
    T: serde::de::DeserializeOwned + zbus::zvariant::Type,
{
    let body = msg.body();
    body.deserialize::<T>().map_err(|e| BusError::Invalid {
        what: "method call body",
        reason: e.to_string(),
    })
}

/// Resolves a `BusName` argument (unique or well-known) to the peer it currently names.
fn resolve_bus_name(bus: &Bus, name: &str) -> Result<PeerId> {
    if name == DRIVER_NAME {
        return Ok(DRIVER_PEER_ID);
    }
    if let Some(stripped) = name.strip_prefix(':') {
        let n: u64 = stripped
            .rsplit('.')
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| BusError::Invalid {
                what: "unique name",
                reason: format!("`{name}` is malformed"),
            })?;
        let id = PeerId::new(n);
        if bus.peers.contains_key(&id) {
            return Ok(id);
        }
        return Err(BusError::NotFound(format!("Name `{name}` is not owned by anyone.")));
    }
    bus.names
        .lookup(name)
        .ok_or_else(|| BusError::NotFound(format!("Name `{name}` is not owned by anyone. Take it!")))
}

/// Group membership is tracked as raw GIDs (§6: `getgrouplist` has no group-name lookup without
/// another syscall round trip), so `<policy group="...">` matching is against the numeric GID
/// rendered as a string — see DESIGN.md for the tradeoff this accepts.
fn identity_groups(peer: &Peer) -> Vec<String> {
    peer.groups().iter().map(|g| g.to_string()).collect()
}

async fn handle_hello(bus: &mut Bus, sender: PeerId, _msg: &Message) -> Result<String> {
    let peer = bus
        .peers
        .get_mut(&sender)
        .ok_or_else(|| BusError::NotFound(format!("peer {sender}")))?;
    if peer.state() != PeerState::Authenticated {
        return Err(BusError::Refused(
            "Hello may only be called once, immediately after connecting".to_string(),
        ));
    }
    assert!(peer.transition(PeerState::Registered));
    let unique_name = sender.to_unique_name();

    // Order matters: the `Hello` reply (built by `finish` right after this returns) must reach
    // the client before `NameOwnerChanged`/`NameAcquired` do.
    emit_name_event(
        bus,
        NameEvent::OwnerChanged {
            name: unique_name.clone(),
            old: None,
            new: Some(sender),
        },
    )
    .await;
    emit_name_event(
        bus,
        NameEvent::Acquired {
            name: unique_name.clone(),
            peer: sender,
        },
    )
    .await;

    Ok(unique_name)
}

async fn handle_request_name(bus: &mut Bus, sender: PeerId, msg: &Message) -> Result<u32> {
    let (name, raw_flags): (String, u32) = body_as(msg)?;
    NameRegistry::validate_requestable(&name)?;

    let peer = bus
        .peers
        .get(&sender)
        .ok_or_else(|| BusError::NotFound(format!("peer {sender}")))?;
    if peer.is_monitor() {
        return Err(BusError::Refused(
            "a monitor may not own a well-known name".to_string(),
        ));
    }
    let groups = identity_groups(peer);
    let identity = Identity {
        uid: peer.uid(),
        username: peer.username(),
        groups: &groups,
    };
    if !bus.policy.check_own(&identity, &name) {
        return Err(BusError::AccessDenied(format!(
            "policy denies ownership of `{name}`"
        )));
    }

    let flags = RequestNameFlags::from_bits(raw_flags).unwrap_or_else(|e| e.truncate());
    let (reply, events) = bus.names.request_name(&name, sender, flags);
    for event in events {
        emit_name_event(bus, event).await;
    }
    Ok(reply.as_u32())
}

async fn handle_release_name(bus: &mut Bus, sender: PeerId, msg: &Message) -> Result<u32> {
    let (name,): (String,) = body_as(msg)?;
    let (reply, events) = bus.names.release_name(&name, sender);
    for event in events {
        emit_name_event(bus, event).await;
    }
    Ok(reply.as_u32())
}

fn handle_add_match(bus: &mut Bus, sender: PeerId, msg: &Message) -> Result<()> {
    let (rule,): (String,) = body_as(msg)?;
    bus.add_match(sender, &rule)
}

fn handle_remove_match(bus: &mut Bus, sender: PeerId, msg: &Message) -> Result<()> {
    let (rule,): (String,) = body_as(msg)?;
    bus.remove_match(sender, &rule)
}

fn handle_get_name_owner(bus: &Bus, msg: &Message) -> Result<String> {
    let (name,): (String,) = body_as(msg)?;
    let id = resolve_bus_name(bus, &name)?;
    if id == DRIVER_PEER_ID {
        return Ok(DRIVER_NAME.to_string());
    }
    Ok(id.to_unique_name())
}

fn list_names(bus: &Bus) -> Vec<String> {
    let mut names: Vec<String> = bus.peers.keys().map(|id| id.to_unique_name()).collect();
    names.push(DRIVER_NAME.to_string());
    names.extend(bus.names.list_names());
    names
}

fn handle_list_queued_owners(bus: &Bus, msg: &Message) -> Result<Vec<String>> {
    let (name,): (String,) = body_as(msg)?;
    let owners = bus.names.queued_owners(&name);
    if owners.is_empty() {
        return Err(BusError::NotFound(
            "Name is not owned by anyone. Take it!".to_string(),
        ));
    }
    Ok(owners.into_iter().map(|id| id.to_unique_name()).collect())
}

fn handle_name_has_owner(bus: &Bus, msg: &Message) -> Result<bool> {
    let (name,): (String,) = body_as(msg)?;
    if name == DRIVER_NAME {
        return Ok(true);
    }
    Ok(resolve_bus_name(bus, &name).is_ok())
}

fn handle_get_connection_unix_process_id(bus: &Bus, msg: &Message) -> Result<u32> {
    let (name,): (String,) = body_as(msg)?;
    let id = resolve_bus_name(bus, &name)?;
    bus.peers
        .get(&id)
        .and_then(Peer::pid)
        .ok_or_else(|| BusError::NotFound(format!("could not determine process ID of `{name}`")))
}

fn handle_get_connection_unix_user(bus: &Bus, msg: &Message) -> Result<u32> {
    let (name,): (String,) = body_as(msg)?;
    let id = resolve_bus_name(bus, &name)?;
    bus.peer_uid(id)
}

fn handle_get_connection_credentials(
    bus: &Bus,
    msg: &Message,
) -> Result<HashMap<String, Value<'static>>> {
    let (name,): (String,) = body_as(msg)?;
    let id = resolve_bus_name(bus, &name)?;
    let peer = bus
        .peers
        .get(&id)
        .ok_or_else(|| BusError::NotFound(format!("peer `{name}` not found")))?;

    let mut creds = HashMap::new();
    creds.insert("UnixUserID".to_string(), Value::U32(peer.uid()));
    if let Some(pid) = peer.pid() {
        creds.insert("ProcessID".to_string(), Value::U32(pid));
    }
    Ok(creds)
}

fn handle_become_monitor(bus: &mut Bus, sender: PeerId, msg: &Message) -> Result<()> {
    let (rules, _flags): (Vec<String>, u32) = body_as(msg)?;
    for rule in &rules {
        bus.add_match(sender, rule)?;
    }
    bus.become_monitor(sender)
}

/// `org.freedesktop.DBus.Properties.{Get,GetAll,Set}` on the driver's own object: `Features` and
/// `Interfaces` are both empty since this design doesn't implement service activation. Builds and
/// enqueues its own reply directly since `Get` replies with a bare variant (`v`) while `GetAll`
/// replies with a dictionary (`a{sv}`) — two incompatible body shapes the generic `finish` helper
/// isn't set up to pick between.
fn handle_properties(bus: &mut Bus, sender: PeerId, msg: &Message, reply_expected: bool) -> Result<()> {
    let header = msg.header();
    match header.member().map(|m| m.as_str()) {
        Some("Get") => {
            let (_iface, prop): (String, String) = body_as(msg)?;
            match prop.as_str() {
                "Features" | "Interfaces" => {
                    if reply_expected {
                        let value = Value::from(Vec::<String>::new());
                        reply_ok(bus, sender, msg, &value);
                    }
                    Ok(())
                }
                other => Err(BusError::NotFound(format!("no such property `{other}`"))),
            }
        }
        Some("GetAll") => {
            if reply_expected {
                let empty: HashMap<String, Value<'static>> = HashMap::new();
                reply_ok(bus, sender, msg, &empty);
            }
            Ok(())
        }
        Some("Set") => Err(BusError::AccessDenied(
            "org.freedesktop.DBus properties are read-only".to_string(),
        )),
        other => Err(BusError::NotFound(format!(
            "unknown method `{}`",
            other.unwrap_or_default()
        ))),
    }
}

/// Converts a [`NameEvent`] into the matching wire signal(s), keeping per-peer `owned_names` and
/// the `Names` quota charge in sync with the registry's idea of who owns what (§4.3/§4.1).
pub(crate) async fn emit_name_event(bus: &mut Bus, event: NameEvent) {
    match event {
        NameEvent::OwnerChanged { name, old, new } => {
            let body = (
                name,
                old.map(PeerId::to_unique_name).unwrap_or_default(),
                new.map(PeerId::to_unique_name).unwrap_or_default(),
            );
            let built = zbus::message::Builder::signal(PATH, INTERFACE, "NameOwnerChanged")
                .and_then(|b| b.build(&body));
            if let Ok(msg) = built {
                if let Err(e) = bus.broadcast(DRIVER_PEER_ID, msg, None).await {
                    warn!("failed to broadcast NameOwnerChanged: {e}");
                }
            }
        }
        NameEvent::Lost { name, peer } => {
            if let Some(p) = bus.peers.get_mut(&peer) {
                p.note_name_released(&name);
                if let Some(charge) = p.take_name_charge(&name) {
                    bus.users.release(charge);
                }
            }
            let built = zbus::message::Builder::signal(PATH, INTERFACE, "NameLost")
                .and_then(|b| b.build(&(name,)));
            if let Ok(msg) = built {
                enqueue(bus, peer, msg);
            }
        }
        NameEvent::Acquired { name, peer } => {
            if let Some(p) = bus.peers.get_mut(&peer) {
                p.note_name_owned(name.clone());
            }
            if let Ok(uid) = bus.peer_uid(peer) {
                match bus.users.charge(uid, SlotKind::Names, 1) {
                    Ok(charge) => {
                        if let Some(p) = bus.peers.get_mut(&peer) {
                            p.set_name_charge(name.clone(), charge);
                        } else {
                            bus.users.release(charge);
                        }
                    }
                    Err(e) => warn!(
                        peer = %peer,
                        name = %name,
                        "Names quota exceeded while granting ownership: {e}; not retroactively denying"
                    ),
                }
            }
            let built = zbus::message::Builder::signal(PATH, INTERFACE, "NameAcquired")
                .and_then(|b| b.build(&(name,)));
            if let Ok(msg) = built {
                enqueue(bus, peer, msg);
            }
        }
    }
}
