//! The local error taxonomy (§7 of the design).
//!
//! Two layers: a small enum of named kinds that callers handle explicitly and map either to a
//! wire error or to a disconnect, and `anyhow::Error` for the "internal/abort" variant that
//! propagates up to the dispatch loop and terminates the offending peer (or the process).

use zbus::names::OwnedUniqueName;

/// A local, recoverable error produced by the routing/accounting engine.
///
/// Every variant here is handled by its caller: either folded into a wire-level `fdo::Error`
/// reply, or used to decide that the offending peer must be disconnected. See
/// [`BusError::wire_error`] and [`BusError::disconnects_peer`] for the mapping matrix.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// A per-user resource limit would have been exceeded.
    #[error("quota exceeded for {slot}")]
    Quota { slot: &'static str },

    /// A match rule, name, or argument failed to parse or violated a grammar constraint.
    #[error("invalid {what}: {reason}")]
    Invalid {
        what: &'static str,
        reason: String,
    },

    /// Lookup failed: no such peer, name, match rule, or reply slot.
    #[error("not found: {0}")]
    NotFound(String),

    /// An identical claim already exists (duplicate reply serial, etc.).
    #[error("already exists: {0}")]
    Exists(String),

    /// The policy engine denied the operation.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The peer's connection reached end-of-file; this is not itself an error condition, only a
    /// trigger for the goodbye cascade.
    #[error("peer disconnected")]
    Eof,

    /// The peer violated the wire protocol (sent a reply with no matching call, addressed a
    /// message it wasn't allowed to send, etc.) and must be dropped.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The peer asked for something the broker refuses to ever support.
    #[error("refused: {0}")]
    Refused(String),

    /// A method return/error message's `reply_serial` didn't match any outstanding call from
    /// that sender.
    #[error("unexpected reply from {sender} with serial {serial}")]
    UnexpectedReply {
        sender: OwnedUniqueName,
        serial: u32,
    },

    /// `org.freedesktop.DBus` or another unique/reserved name was used where a requestable
    /// well-known name was expected.
    #[error("name `{0}` is reserved")]
    NameReserved(String),

    /// A `:`-prefixed unique name was passed to `RequestName`/`ReleaseName`.
    #[error("name `{0}` is a unique name, not requestable")]
    NameUnique(String),
}

impl BusError {
    /// Maps a local error to the `org.freedesktop.DBus.Error.*` name the client should see in a
    /// method-call error reply, per the §7 mapping matrix. Returns `None` for errors that are
    /// never turned into a reply (disconnect-only, or silently-dropped for non-method-calls).
    pub fn wire_error(&self) -> zbus::fdo::Error {
        use zbus::fdo::Error as E;

        match self {
            BusError::Quota { slot } => E::LimitsExceeded(format!("{slot} limit exceeded")),
            BusError::Invalid { what, reason } if *what == "match rule" => {
                E::MatchRuleInvalid(reason.clone())
            }
            BusError::Invalid { reason, .. } => E::InvalidArgs(reason.clone()),
            BusError::NotFound(msg) if msg.contains("match rule") => {
                E::MatchRuleNotFound(msg.clone())
            }
            BusError::NotFound(msg) => E::NameHasNoOwner(msg.clone()),
            BusError::Exists(msg) => E::NameHasNoOwner(msg.clone()),
            BusError::AccessDenied(msg) => E::AccessDenied(msg.clone()),
            BusError::Eof => E::Disconnected("peer disconnected".to_string()),
            BusError::ProtocolViolation(msg) => E::Failed(msg.clone()),
            BusError::Refused(msg) => E::NotSupported(msg.clone()),
            BusError::UnexpectedReply { sender, serial } => E::Failed(format!(
                "unexpected reply from {sender} with serial {serial}"
            )),
            BusError::NameReserved(name) => {
                E::InvalidArgs(format!("`{name}` is a reserved name"))
            }
            BusError::NameUnique(name) => {
                E::InvalidArgs(format!("`{name}` is a unique name"))
            }
        }
    }

    /// Whether this error, left unhandled by the caller, requires disconnecting the peer that
    /// caused it (rather than just sending back a wire-level error reply).
    pub fn disconnects_peer(&self) -> bool {
        matches!(self, BusError::ProtocolViolation(_) | BusError::Eof)
    }
}

/// Convenience alias for fallible operations in the routing/accounting engine.
pub type Result<T> = std::result::Result<T, BusError>;
