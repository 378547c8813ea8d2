use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::{ConnId, Identity, ServerEvent};

pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

struct Connection {
    identity: Option<Identity>,
    tx: EventSender,
}

/// An announced identity and the connections it is reachable through, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlineUser {
    pub identity: Identity,
    pub connections: Vec<ConnId>,
}

/// What [`ConnectionRegistry::announce`] changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Announced {
    /// The (identity, connection) pair was not known before.
    pub recorded: bool,
    /// The connection previously belonged to this identity, which has no connections left.
    pub went_offline: Option<Identity>,
}

/// What [`ConnectionRegistry::unregister`] removed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Unregistered {
    /// Identity the connection was announced as.
    pub identity: Option<Identity>,
    /// The identity's online entry was removed along with its last connection.
    pub went_offline: bool,
}

/// Live connections and the identities announced on them.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnId, Connection>,
    online: Vec<OnlineUser>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, conn_id: ConnId, tx: EventSender) {
        self.connections.insert(conn_id, Connection { identity: None, tx });
    }

    pub fn announce(&mut self, conn_id: ConnId, identity: &str) -> Announced {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            debug!(%conn_id, identity, "announce from unknown connection");
            return Announced::default();
        };

        let previous = conn.identity.replace(identity.to_owned());
        if previous.as_deref() == Some(identity) {
            return Announced::default();
        }

        let went_offline = previous.and_then(|old| self.detach(conn_id, &old).then_some(old));

        match self.online.iter_mut().find(|u| u.identity == identity) {
            Some(user) => user.connections.push(conn_id),
            None => self.online.push(OnlineUser {
                identity: identity.to_owned(),
                connections: vec![conn_id],
            }),
        }

        Announced { recorded: true, went_offline }
    }

    pub fn unregister(&mut self, conn_id: ConnId) -> Unregistered {
        let Some(conn) = self.connections.remove(&conn_id) else {
            return Unregistered::default();
        };
        let Some(identity) = conn.identity else {
            return Unregistered::default();
        };

        let went_offline = self.detach(conn_id, &identity);
        Unregistered { identity: Some(identity), went_offline }
    }

    /// Removes `conn_id` from `identity`'s entry. Returns true if that emptied and removed it.
    fn detach(&mut self, conn_id: ConnId, identity: &str) -> bool {
        let Some(pos) = self.online.iter().position(|u| u.identity == identity) else {
            return false;
        };
        let user = &mut self.online[pos];
        user.connections.retain(|c| *c != conn_id);
        if user.connections.is_empty() {
            self.online.remove(pos);
            return true;
        }
        false
    }

    pub fn owner_of(&self, conn_id: ConnId) -> Option<&Identity> {
        self.connections.get(&conn_id)?.identity.as_ref()
    }

    /// First known connection of `identity`.
    pub fn find(&self, identity: &str) -> Option<ConnId> {
        self.online
            .iter()
            .find(|u| u.identity == identity)
            .and_then(|u| u.connections.first().copied())
    }

    pub fn is_online(&self, identity: &str) -> bool {
        self.find(identity).is_some()
    }

    pub fn online_identities(&self) -> Vec<Identity> {
        self.online.iter().map(|u| u.identity.clone()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Queues `event` on one connection. Returns false if the connection is gone.
    pub fn send(&self, conn_id: ConnId, event: ServerEvent) -> bool {
        match self.connections.get(&conn_id) {
            Some(conn) => conn.tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn send_to(&self, identity: &str, event: ServerEvent) -> bool {
        match self.find(identity) {
            Some(conn_id) => self.send(conn_id, event),
            None => {
                debug!(identity, "target offline");
                false
            }
        }
    }

    pub fn broadcast(&self, event: &ServerEvent) {
        for conn in self.connections.values() {
            let _ = conn.tx.send(event.clone());
        }
    }
}
