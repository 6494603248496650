//! The bus: arena ownership, the dispatch loop, and the router (§4.6, §4.7).
//!
//! Every registry the bus owns is a plain `HashMap` keyed by a stable ID (§9 design notes); there
//! are no `Rc`/`RefCell` cycles between `Peer`, `Name`, and `MatchRule` because nothing holds a
//! pointer to another — only IDs, resolved back through the owning map on each use.

use std::{collections::HashMap, path::PathBuf, str::FromStr};

use futures_util::{stream::FuturesUnordered, StreamExt};
use tokio::net::UnixListener;
use tracing::{debug, info, warn};
use zbus::{
    names::{BusName, UniqueName},
    DBusError, Guid, Message,
};

use crate::{
    collaborators::{Codec, ControllerChannel, ControllerRequest, PeerCredentialsSource, ZbusCodec, ZbusPeerCredentialsSource},
    config::BusConfig,
    error::{BusError, Result},
    ids::{Counter, MatchRuleId, PeerId, TransactionId},
    match_rule::{self, Filter, MatchRegistry, MatchRules, MessageKind, Placement},
    name_registry::{NameEvent, NameRegistry},
    peer::{Peer, PeerState},
    policy::PolicyEngine,
    reply::ReplyRegistry,
    user::{SlotKind, UserRegistry},
};

/// The bus-wide registries plus the listening socket. There is exactly one `Bus` per process;
/// [`Bus::run`] is the single task that ever mutates it (§4.7).
pub struct Bus {
    pub(crate) guid: Guid<'static>,
    listener: UnixListener,
    socket_path: PathBuf,
    pub(crate) peers: HashMap<PeerId, Peer>,
    pub(crate) names: NameRegistry,
    pub(crate) match_rules: MatchRules,
    wildcard_matches: MatchRegistry,
    driver_matches: MatchRegistry,
    monitor_matches: MatchRegistry,
    replies: ReplyRegistry,
    pub(crate) users: UserRegistry,
    pub(crate) policy: PolicyEngine,
    pub(crate) next_peer_id: Counter,
    next_txn_id: Counter,
    driver_serial: Counter,
}

impl Bus {
    /// Binds a UNIX domain socket at `socket_path` (removing any stale socket file first) and
    /// returns a freshly initialized, empty bus. Grounded on the reference broker's own
    /// `Bus::unix_stream`/`default_address` shape, simplified to UNIX-only per this design's
    /// scope (§1 Non-goals: TCP/nonce-tcp/autolaunch transports).
    pub async fn bind(socket_path: PathBuf, config: BusConfig) -> anyhow::Result<Self> {
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }
        let listener = UnixListener::bind(&socket_path)?;
        info!(path = %socket_path.display(), "listening");

        Ok(Self {
            guid: Guid::generate(),
            listener,
            socket_path,
            peers: HashMap::new(),
            names: NameRegistry::new(),
            match_rules: MatchRules::new(),
            wildcard_matches: MatchRegistry::default(),
            driver_matches: MatchRegistry::default(),
            monitor_matches: MatchRegistry::default(),
            replies: ReplyRegistry::new(),
            users: UserRegistry::new(config.limits),
            policy: PolicyEngine::new(config.ruleset),
            next_peer_id: Counter::new(),
            next_txn_id: Counter::new(),
            driver_serial: Counter::new(),
        })
    }

    pub fn address(&self) -> String {
        format!("unix:path={}", self.socket_path.display())
    }

    pub async fn cleanup(self) -> std::io::Result<()> {
        std::fs::remove_file(&self.socket_path)
    }

    /// The dispatch loop (§4.7): each turn either accepts a new connection, routes one already
    /// up-and-authenticated peer's next message, or services the controller channel, then flushes
    /// every peer's outbox before looping. Flushing every turn is what keeps this a faithful,
    /// if simplified, rendering of the two-phase "read phase then write phase" model without
    /// needing a batched drain-to-exhaustion pass (see DESIGN.md).
    pub async fn run(&mut self, mut controller: impl ControllerChannel) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            if let Err(e) = self.accept_peer(stream).await {
                                warn!("failed to admit new connection: {e:#}");
                            }
                        }
                        Err(e) => warn!("accept failed: {e}"),
                    }
                }
                received = receive_one(&mut self.peers) => {
                    if let Some((id, result)) = received {
                        self.handle_receive(id, result).await;
                    }
                }
                req = controller.recv() => {
                    match req {
                        Some(ControllerRequest::ReloadPolicy) => {
                            debug!("controller requested policy reload (no-op placeholder)");
                        }
                        Some(ControllerRequest::Shutdown) | None => return Ok(()),
                    }
                }
            }
            self.flush_outboxes().await;
        }
    }

    async fn accept_peer(&mut self, stream: tokio::net::UnixStream) -> anyhow::Result<()> {
        let id = PeerId::new(self.next_peer_id.next());
        let conn = zbus::connection::Builder::unix_stream(stream)
            .server(self.guid.clone())?
            .p2p()
            .build()
            .await?;

        let credentials = ZbusPeerCredentialsSource::new(&conn).credentials().await?;

        if !self.policy.check_connect(&crate::policy::Identity {
            uid: credentials.uid,
            username: credentials.username.as_deref(),
            groups: &credentials
                .groups
                .iter()
                .map(|g| g.to_string())
                .collect::<Vec<_>>(),
        }) {
            anyhow::bail!("connection from uid {} denied by policy", credentials.uid);
        }

        let charge = self.users.charge(credentials.uid, SlotKind::Objects, 1)?;

        let mut peer = Peer::new(id, credentials, Box::new(ZbusCodec::new(conn)) as Box<dyn Codec>);
        peer.set_objects_charge(charge);
        assert!(peer.transition(PeerState::Authenticating));
        assert!(peer.transition(PeerState::Authenticated));
        self.peers.insert(id, peer);
        debug!(peer = %id, "accepted");
        Ok(())
    }

    async fn handle_receive(&mut self, id: PeerId, result: std::io::Result<Option<Message>>) {
        match result {
            Ok(Some(msg)) => {
                if let Err(e) = self.route_message(id, msg).await {
                    if e.disconnects_peer() {
                        self.goodbye(id).await;
                    }
                }
            }
            Ok(None) | Err(_) => self.goodbye(id).await,
        }
    }

    async fn flush_outboxes(&mut self) {
        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for id in ids {
            loop {
                let Some(peer) = self.peers.get_mut(&id) else { break };
                let Some((msg, charge)) = peer.pop_outbox() else { break };
                let result = peer.codec_mut().send(&msg).await;
                if let Some(charge) = charge {
                    self.users.release(charge);
                }
                if let Err(e) = result {
                    warn!(peer = %id, "send failed: {e}");
                    self.goodbye(id).await;
                    break;
                }
            }
        }
    }

    /// Routes one message from an already-registered (or about-to-`Hello`) peer (§4.6).
    pub(crate) async fn route_message(&mut self, sender: PeerId, msg: Message) -> Result<()> {
        let header = msg.header();
        let msg_type = MessageKind::from(header.message_type());

        let dest_name = header.destination().cloned();
        let is_driver_call = matches!(
            &dest_name,
            Some(BusName::WellKnown(n)) if n.as_str() == match_rule::DRIVER_NAME
        );

        match msg_type {
            MessageKind::MethodCall => {
                let reply_expected = !header
                    .primary()
                    .flags()
                    .contains(zbus::message::Flags::NoReplyExpected);
                if is_driver_call {
                    crate::driver::handle_call(self, sender, &msg, reply_expected).await?;
                } else {
                    let dest = match self.resolve_destination(dest_name.as_ref()) {
                        Ok(dest) => dest,
                        Err(e) => {
                            if reply_expected {
                                self.reply_route_error(sender, &msg, &e);
                            }
                            return Ok(());
                        }
                    };
                    if let Err(e) = self.check_send_policy(sender, &header, dest_name.as_ref(), false) {
                        if reply_expected {
                            self.reply_route_error(sender, &msg, &e);
                        }
                        return Ok(());
                    }
                    if reply_expected {
                        let callee_uid = self.peer_uid(dest)?;
                        self.replies.open(
                            &mut self.users,
                            sender,
                            callee_uid,
                            dest,
                            header.primary().serial_num().into(),
                            msg.clone(),
                        )?;
                    }
                    self.queue_call(sender, dest, msg.clone()).await?;
                }
            }
            MessageKind::MethodReturn | MessageKind::Error => {
                let dest = self.resolve_destination(dest_name.as_ref())?;
                let reply_serial = header
                    .reply_serial()
                    .ok_or_else(|| BusError::ProtocolViolation("reply with no reply_serial".into()))?;
                let caller = self
                    .replies
                    .resolve(&mut self.users, sender, dest, reply_serial.into())?;
                self.queue_reply(sender, caller, msg.clone()).await?;
            }
            MessageKind::Signal => {
                self.check_send_policy(sender, &header, dest_name.as_ref(), true)?;
                self.broadcast(sender, msg.clone(), None).await?;
            }
        }
        Ok(())
    }

    /// `check_send` (§4.5): denies a unicast method call before it's charged against anyone, so a
    /// rejected send costs the caller nothing but the error reply.
    fn check_send_policy(
        &self,
        sender: PeerId,
        header: &zbus::message::Header<'_>,
        dest_name: Option<&BusName<'_>>,
        is_broadcast: bool,
    ) -> Result<()> {
        let Some(peer) = self.peers.get(&sender) else {
            return Ok(());
        };
        let groups = identity_groups(peer);
        let identity = crate::policy::Identity {
            uid: peer.uid(),
            username: peer.username(),
            groups: &groups,
        };
        let ctx = crate::policy::MessageContext {
            message_type: MessageKind::from(header.message_type()),
            interface: header.interface().map(|i| i.as_str()),
            member: header.member().map(|m| m.as_str()),
            path: header.path().map(|p| p.as_str()),
            destination: dest_name.map(|d| d.as_str()),
            is_broadcast,
            is_reply_to_own_call: false,
        };
        if self.policy.check_send(&identity, &ctx) {
            Ok(())
        } else {
            Err(BusError::AccessDenied(format!(
                "policy denies send to {}",
                ctx.destination.unwrap_or("<unknown>")
            )))
        }
    }

    /// `check_receive` (§4.5): evaluated per matched recipient just before a broadcast/unicast
    /// copy is actually enqueued for them, so a deny simply skips that one delivery.
    fn check_receive_policy(&self, owner: PeerId, filter: &Filter<'_>) -> bool {
        let Some(peer) = self.peers.get(&owner) else {
            return true;
        };
        let groups = identity_groups(peer);
        let identity = crate::policy::Identity {
            uid: peer.uid(),
            username: peer.username(),
            groups: &groups,
        };
        let ctx = crate::policy::MessageContext {
            message_type: filter.message_type,
            interface: filter.interface,
            member: filter.member,
            path: filter.path,
            destination: None,
            is_broadcast: filter.destination.is_none(),
            is_reply_to_own_call: false,
        };
        let sender_name = if filter.sender == crate::ids::DRIVER_PEER_ID {
            match_rule::DRIVER_NAME.to_string()
        } else {
            filter.sender.to_unique_name()
        };
        self.policy
            .check_receive(&identity, &ctx, Some(sender_name.as_str()))
    }

    pub(crate) fn peer_uid(&self, id: PeerId) -> Result<crate::user::Uid> {
        self.peers
            .get(&id)
            .map(Peer::uid)
            .ok_or_else(|| BusError::NotFound(format!("peer {id}")))
    }

    /// Resolves a `BusName` destination header to a concrete peer, well-known or unique.
    pub(crate) fn resolve_destination(&self, dest: Option<&BusName<'_>>) -> Result<PeerId> {
        let dest = dest.ok_or_else(|| BusError::ProtocolViolation("no destination".into()))?;
        match dest {
            BusName::Unique(u) => parse_unique(u),
            BusName::WellKnown(name) => self
                .names
                .lookup(name.as_str())
                .ok_or_else(|| BusError::NotFound(format!("no owner for {name}"))),
        }
    }

    /// `queue_call` (§4.6): directly enqueues into `dest`'s outbox, charging the bytes against the
    /// *sender's* UID, then additionally broadcasts a copy to any eavesdropper (per-message a
    /// unicast filter only ever matches `eavesdrop_list` entries, never plain subscriptions).
    async fn queue_call(&mut self, sender: PeerId, dest: PeerId, msg: Message) -> Result<()> {
        self.charge_and_enqueue(sender, dest, msg.clone())?;
        self.broadcast(sender, msg, Some(dest)).await?;
        Ok(())
    }

    /// `queue_reply` (§4.6): same shape as `queue_call`, used for `method_return`/`error`.
    async fn queue_reply(&mut self, sender: PeerId, dest: PeerId, msg: Message) -> Result<()> {
        self.charge_and_enqueue(sender, dest, msg.clone())?;
        self.broadcast(sender, msg, Some(dest)).await?;
        Ok(())
    }

    pub(crate) fn charge_and_enqueue(&mut self, actor: PeerId, dest: PeerId, msg: Message) -> Result<()> {
        let uid = self.peer_uid(actor)?;
        let bytes = msg.data().len() as u64;
        let charge = self.users.charge(uid, SlotKind::Bytes, bytes)?;
        let Some(peer) = self.peers.get_mut(&dest) else {
            self.users.release(charge);
            return Err(BusError::NotFound(format!("peer {dest}")));
        };
        // Held until the message actually leaves the outbox (`Peer::pop_outbox`), so BYTES
        // reflects real outstanding queue depth rather than being charged for zero wall-clock time.
        peer.enqueue_charged(msg, charge);
        Ok(())
    }

    /// `broadcast` (§4.6): delivers `msg` to the wildcard registry, the driver registry (if the
    /// sender addressed the driver), the sender's own per-name registries, and the bus-wide
    /// monitor registry — skipping `addressed_receiver` to avoid double delivery for the
    /// eavesdrop-copy-of-a-unicast-call case, and deduping per destination peer via
    /// `Peer::mark_delivered` so a message matched by more than one of a peer's rules (or by both
    /// a normal rule and a monitor rule) is only enqueued once.
    pub(crate) async fn broadcast(
        &mut self,
        sender: PeerId,
        msg: Message,
        addressed_receiver: Option<PeerId>,
    ) -> Result<()> {
        let header = msg.header();
        let message_type = MessageKind::from(header.message_type());
        let interface = header.interface().map(|i| i.as_str());
        let member = header.member().map(|m| m.as_str());
        let path = header.path().map(|p| p.as_str());
        let destination = addressed_receiver;
        let args = std::collections::BTreeMap::new();
        let filter = Filter {
            message_type,
            sender,
            destination,
            interface,
            member,
            path,
            args: &args,
        };
        let txn = TransactionId::new(self.next_txn_id.next());

        let mut targets: Vec<MatchRuleId> = self
            .wildcard_matches
            .candidates(filter.is_unicast())
            .collect();
        if sender == crate::ids::DRIVER_PEER_ID {
            targets.extend(self.driver_matches.candidates(filter.is_unicast()));
        }
        if let Some(peer) = self.peers.get(&sender) {
            targets.extend(peer.matches().candidates(filter.is_unicast()));
        }
        for name in self.names.names_owned_by(sender) {
            if let Some(registry) = self.names.matches_for(&name) {
                targets.extend(registry.candidates(filter.is_unicast()));
            }
        }
        // Monitor rules aren't sender-gated: a monitor sees every message matching its own
        // interface/member/path/type keys, not just ones addressed through its own placement.
        targets.extend(self.monitor_matches.candidates(filter.is_unicast()));

        for rule_id in targets {
            let Some(rule) = self.match_rules.get(rule_id) else { continue };
            if !rule.keys().matches(&filter, &self.names) {
                continue;
            }
            let owner = rule.owner();
            if Some(owner) == addressed_receiver {
                continue;
            }
            let Some(peer) = self.peers.get_mut(&owner) else { continue };
            if !peer.mark_delivered(txn) {
                continue;
            }
            if !self.check_receive_policy(owner, &filter) {
                continue;
            }
            self.charge_and_enqueue(sender, owner, msg.clone())?;
        }
        Ok(())
    }

    /// `AddMatch` (§4.8/§4.2): parses, coalesces, and links a rule owned by `owner`.
    pub(crate) fn add_match(&mut self, owner: PeerId, rule: &str) -> Result<()> {
        let uid = self.peer_uid(owner)?;
        match self.match_rules.add(owner, rule)? {
            match_rule::AddOutcome::Coalesced(_) => Ok(()),
            match_rule::AddOutcome::New(id) => {
                let charge = self.users.charge(uid, SlotKind::Matches, 1)?;
                let keys = self.match_rules.get(id).expect("just inserted").keys().clone();
                let placement = match_rule::resolve_placement(
                    keys.sender.as_ref(),
                    |candidate| self.peers.contains_key(&candidate),
                    PeerId::new(self.next_peer_id.peek_next()),
                );
                self.link_rule(id, &placement, keys.is_eavesdrop());
                self.match_rules.set_placement(id, placement);
                self.match_rules
                    .get_mut(id)
                    .expect("just inserted")
                    .set_charge(charge);
                Ok(())
            }
        }
    }

    fn link_rule(&mut self, id: MatchRuleId, placement: &Placement, eavesdrop: bool) {
        match placement {
            Placement::Wildcard | Placement::WildcardPendingPeer => {
                self.wildcard_matches.link(id, eavesdrop)
            }
            Placement::Driver => self.driver_matches.link(id, eavesdrop),
            Placement::Peer(peer_id) => {
                if let Some(peer) = self.peers.get_mut(peer_id) {
                    peer.matches_mut().link(id, eavesdrop);
                }
            }
            Placement::Name(name) => self.names.link_match(name, id, eavesdrop),
            Placement::Monitor => self.monitor_matches.link(id, eavesdrop),
            Placement::NeverFiring => {}
        }
    }

    fn unlink_rule(&mut self, id: MatchRuleId, placement: &Placement) {
        match placement {
            Placement::Wildcard | Placement::WildcardPendingPeer => {
                self.wildcard_matches.unlink(id)
            }
            Placement::Driver => self.driver_matches.unlink(id),
            Placement::Peer(peer_id) => {
                if let Some(peer) = self.peers.get_mut(peer_id) {
                    peer.matches_mut().unlink(id);
                }
            }
            Placement::Name(name) => self.names.unlink_match(name, id),
            Placement::Monitor => self.monitor_matches.unlink(id),
            Placement::NeverFiring => {}
        }
    }

    /// `RemoveMatch` (§4.8).
    pub(crate) fn remove_match(&mut self, owner: PeerId, rule: &str) -> Result<()> {
        if let Some(removed) = self.match_rules.remove(owner, rule)? {
            self.unlink_rule(removed.id, &removed.placement);
            if let Some(charge) = removed.charge {
                self.users.release(charge);
            }
        }
        Ok(())
    }

    /// `become_monitor` (§4.6, §4.8 `Monitoring.BecomeMonitor`): a one-way transition. Every rule
    /// the peer owns is moved out of whatever registry its `sender=` key originally placed it in
    /// and reassigned to the bus-wide monitor registry with `eavesdrop=true`, so it keeps matching
    /// by its own interface/member/path/type keys but now also sees unicast traffic addressed to
    /// others — the ordinary delivery path (`Bus::broadcast`) carries it from there, so a monitor
    /// copy still clears `check_receive_policy` and is charged like any other delivery.
    pub(crate) fn become_monitor(&mut self, id: PeerId) -> Result<()> {
        let Some(peer) = self.peers.get_mut(&id) else {
            return Err(BusError::NotFound(format!("peer {id}")));
        };
        if !peer.transition(PeerState::Monitor) {
            return Err(BusError::Refused("peer is not in a state that can monitor".into()));
        }
        for rule_id in self.match_rules.owned_by(id) {
            if let Some(rule) = self.match_rules.get(rule_id) {
                let (id, placement, _) = rule.placement_snapshot();
                self.unlink_rule(id, &placement);
                self.link_rule(id, &Placement::Monitor, true);
                self.match_rules.set_placement(id, Placement::Monitor);
            }
        }
        Ok(())
    }

    /// The disconnect cascade (§4.6 step-by-step):
    /// 1. mark `Disconnecting`/`Freed`
    /// 2. release every well-known name the peer owned (promoting queued claimants)
    /// 3. drop every match rule it owned, unlinking each from its target registry
    /// 4. synthesize `Disconnected` error replies for every call it had outstanding as a callee
    /// 5. drop every call it had outstanding as a caller (nothing left to deliver the reply to)
    /// 6. release its `Objects` charge
    /// 7. remove it from the peer table
    pub(crate) async fn goodbye(&mut self, id: PeerId) {
        let Some(peer) = self.peers.get_mut(&id) else { return };
        let _ = peer.transition(PeerState::Disconnecting);
        let objects_charge = peer.take_objects_charge();

        let name_events = self.names.drop_peer(id);
        self.deliver_name_events(name_events).await;
        self.deliver_name_event(NameEvent::OwnerChanged {
            name: id.to_unique_name(),
            old: Some(id),
            new: None,
        })
        .await;

        let removed = self.match_rules.drop_all_owned_by(id);
        for rule in removed {
            self.unlink_rule(rule.id, &rule.placement);
            if let Some(charge) = rule.charge {
                self.users.release(charge);
            }
        }

        let pending = self.replies.take_pending_for_callee(&mut self.users, id);
        for (caller, _serial, call) in pending {
            self.deliver_disconnected_error(caller, &call).await;
        }
        self.replies.drop_caller(&mut self.users, id);

        if let Some(peer) = self.peers.get_mut(&id) {
            let _ = peer.transition(PeerState::Freed);
        }
        // Drained last, right before the peer is actually dropped: the cascade above can itself
        // enqueue fresh deliveries into this peer's outbox (e.g. a self-owned subscription to
        // `NameOwnerChanged`), and those charges must be released too, not just the ones queued
        // when `goodbye` started.
        if let Some(peer) = self.peers.get_mut(&id) {
            for charge in peer.take_outbox_charges() {
                self.users.release(charge);
            }
        }
        self.peers.remove(&id);
        if let Some(charge) = objects_charge {
            self.users.release(charge);
        }
        debug!(peer = %id, "disconnected");
    }

    /// Synthesizes an `org.freedesktop.DBus.Error.Disconnected` error reply to `to`'s outstanding
    /// call, built against the original `call` so the reply's `reply_serial`/`destination` line up
    /// the way they would if the callee (which just vanished) had actually answered (§4.6 step 4).
    async fn deliver_disconnected_error(&mut self, to: PeerId, call: &Message) {
        let body = "the name owner disconnected during the call";
        let built = zbus::message::Builder::error(&call.header(), "org.freedesktop.DBus.Error.Disconnected")
            .and_then(|b| b.build(&body));
        let Ok(msg) = built else { return };
        let Some(peer) = self.peers.get_mut(&to) else { return };
        peer.enqueue(msg);
    }

    /// Replies to a caller's method call with an `org.freedesktop.DBus.Error.*` reply built from
    /// `err`, for failures discovered before the call is handed off to `driver.rs` (no such
    /// destination, policy denial) — without this, a caller addressing a name nobody owns would
    /// simply never get a reply instead of the prompt error real D-Bus clients expect.
    fn reply_route_error(&mut self, to: PeerId, call: &Message, err: &BusError) {
        match err.wire_error().create_reply(&call.header()) {
            Ok(msg) => {
                if let Some(peer) = self.peers.get_mut(&to) {
                    peer.enqueue(msg);
                }
            }
            Err(e) => warn!("failed to build routing error reply: {e}"),
        }
    }

    async fn deliver_name_events(&mut self, events: Vec<NameEvent>) {
        for event in events {
            self.deliver_name_event(event).await;
        }
    }

    async fn deliver_name_event(&mut self, _event: NameEvent) {
        // Wire formatting for NameOwnerChanged/NameLost/NameAcquired lives in `driver.rs`, which
        // owns the driver's outgoing serial counter and signal-emission helpers.
        crate::driver::emit_name_event(self, _event).await;
    }
}

/// Polls every currently-connected peer's `Codec::receive` concurrently and returns the first one
/// ready, without holding any borrow of `peers` beyond this call (§4.7).
async fn receive_one(
    peers: &mut HashMap<PeerId, Peer>,
) -> Option<(PeerId, std::io::Result<Option<Message>>)> {
    if peers.is_empty() {
        return std::future::pending().await;
    }
    let mut futs: FuturesUnordered<_> = peers
        .iter_mut()
        .map(|(&id, peer)| async move { (id, peer.codec_mut().receive().await) })
        .collect();
    futs.next().await
}

/// Group membership is tracked as raw GIDs, not resolved names (see `collaborators.rs`), so
/// `<policy group="...">` matching is against the numeric GID rendered as a string.
fn identity_groups(peer: &Peer) -> Vec<String> {
    peer.groups().iter().map(|g| g.to_string()).collect()
}

fn parse_unique(name: &UniqueName<'_>) -> Result<PeerId> {
    let s = name.as_str();
    let n: u64 = s
        .rsplit('.')
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| BusError::Invalid {
            what: "unique name",
            reason: format!("`{s}` is not one of ours"),
        })?;
    Ok(PeerId::new(n))
}
