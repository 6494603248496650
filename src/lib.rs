//! A D-Bus message bus (broker): accepts peer connections over a UNIX domain socket, hands out
//! unique names, brokers well-known name ownership, routes method calls/replies/signals according
//! to match rules, and enforces per-user resource quotas and `<policy>` access control along the
//! way.
//!
//! [`bus::Bus`] is the entry point; everything else is a collaborator it owns or calls into.

pub mod bus;
pub mod collaborators;
pub mod config;
mod driver;
pub mod error;
pub mod ids;
pub mod match_rule;
pub mod name_registry;
pub mod peer;
pub mod policy;
pub mod reply;
pub mod tracing_subscriber;
pub mod user;

pub use bus::Bus;
pub use config::{BusConfig, Config};
pub use error::BusError;
