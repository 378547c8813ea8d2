mod registry;

pub use registry::{Announced, ConnectionRegistry, EventSender, OnlineUser, Unregistered};

use tracing::info;

use crate::protocol::ServerEvent;

/// Tells every live connection that `identity` came online or went away.
pub fn broadcast_presence(registry: &ConnectionRegistry, identity: &str, is_online: bool) {
    info!(identity, is_online, "presence changed");
    registry.broadcast(&ServerEvent::PresenceChanged {
        identity: identity.to_owned(),
        is_online,
    });
}
