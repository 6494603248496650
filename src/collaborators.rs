//! Collaborator traits (§6): the seams between the routing/accounting engine and everything this
//! design treats as out of scope — the wire codec, credential retrieval, and the controller
//! channel. Each trait has one default, zbus/tokio-backed implementation; tests substitute their
//! own to drive the engine without a live socket.

use async_trait::async_trait;
use zbus::Message;

use crate::user::Uid;

/// Reads and writes already-authenticated D-Bus messages on a peer's transport.
///
/// The SASL handshake and the raw framing are both out of scope for this design (§1 Non-goals);
/// `Codec` is the boundary past which a [`Peer`](crate::peer::Peer) only ever sees parsed
/// [`Message`] values.
#[async_trait]
pub trait Codec: Send + Sync {
    async fn receive(&mut self) -> std::io::Result<Option<Message>>;
    async fn send(&mut self, message: &Message) -> std::io::Result<()>;
}

/// A zbus connection wrapped to satisfy [`Codec`]. zbus already implements the full SASL state
/// machine and the marshaled-message framing, which is exactly the part of the stack this design
/// keeps out of scope and simply depends on.
pub struct ZbusCodec {
    conn: zbus::Connection,
}

impl ZbusCodec {
    pub fn new(conn: zbus::Connection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &zbus::Connection {
        &self.conn
    }
}

#[async_trait]
impl Codec for ZbusCodec {
    async fn receive(&mut self) -> std::io::Result<Option<Message>> {
        use futures_util::StreamExt;
        let mut stream = zbus::MessageStream::from(&self.conn);
        match stream.next().await {
            Some(Ok(msg)) => Ok(Some(msg)),
            Some(Err(e)) => Err(std::io::Error::other(e)),
            None => Ok(None),
        }
    }

    async fn send(&mut self, message: &Message) -> std::io::Result<()> {
        self.conn
            .send(message)
            .await
            .map_err(std::io::Error::other)
    }
}

/// The identity a freshly-authenticated peer presents to the policy engine and the resource
/// accounting layer.
#[derive(Debug, Clone)]
pub struct PeerCredentials {
    pub uid: Uid,
    pub pid: Option<u32>,
    pub username: Option<String>,
    pub groups: Vec<u32>,
}

/// Resolves a connection's Unix credentials (§6). The uid/pid come from `SO_PEERCRED`
/// (via zbus); supplementary group membership comes from a separate `getgrouplist` lookup that is
/// inherently racy — the kernel doesn't hand back group membership over `SO_PEERCRED`, so this is
/// a best-effort snapshot taken once at authentication time, not re-checked for the connection's
/// lifetime.
#[async_trait]
pub trait PeerCredentialsSource: Send + Sync {
    async fn credentials(&self) -> std::io::Result<PeerCredentials>;
}

pub struct ZbusPeerCredentialsSource<'a> {
    conn: &'a zbus::Connection,
}

impl<'a> ZbusPeerCredentialsSource<'a> {
    pub fn new(conn: &'a zbus::Connection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl PeerCredentialsSource for ZbusPeerCredentialsSource<'_> {
    async fn credentials(&self) -> std::io::Result<PeerCredentials> {
        let creds = self.conn.peer_credentials().await.map_err(std::io::Error::other)?;
        let uid = creds
            .unix_user_id()
            .ok_or_else(|| std::io::Error::other("peer presented no Unix UID"))?;
        let pid = creds.process_id();

        let (username, groups) = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|user| {
                let groups = nix::unistd::getgrouplist(
                    &std::ffi::CString::new(user.name.clone()).unwrap_or_default(),
                    user.gid,
                )
                .unwrap_or_default()
                .into_iter()
                .map(|g| g.as_raw())
                .collect();
                (Some(user.name), groups)
            })
            .unwrap_or((None, Vec::new()));

        Ok(PeerCredentials {
            uid,
            pid,
            username,
            groups,
        })
    }
}

/// A side channel independent of the main D-Bus socket, used by a supervising process to ask the
/// bus to do things no client can (reload policy, report health). Out of scope for this design
/// (§1 Non-goals); the trait exists so `Bus::dispatch_once` has a well-defined place to poll it
/// without hardcoding a transport.
#[async_trait]
pub trait ControllerChannel: Send + Sync {
    async fn recv(&mut self) -> Option<ControllerRequest>;
}

#[derive(Debug, Clone)]
pub enum ControllerRequest {
    ReloadPolicy,
    Shutdown,
}

/// A controller channel that never produces anything, for embedding the bus without a
/// supervisor attached.
#[derive(Default)]
pub struct NullControllerChannel;

#[async_trait]
impl ControllerChannel for NullControllerChannel {
    async fn recv(&mut self) -> Option<ControllerRequest> {
        std::future::pending().await
    }
}
