use std::collections::{HashMap, HashSet};

use crate::protocol::{ConnId, ConversationId};

/// Which connections are subscribed to which conversation room.
///
/// Keeps a reverse index so dropping a connection only touches the rooms it joined.
#[derive(Default)]
pub struct RoomMembership {
    rooms: HashMap<ConversationId, HashSet<ConnId>>,
    joined: HashMap<ConnId, HashSet<ConversationId>>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the connection was not already in the room.
    pub fn join(&mut self, conn_id: ConnId, conversation_id: &str) -> bool {
        self.joined
            .entry(conn_id)
            .or_default()
            .insert(conversation_id.to_owned());
        self.rooms
            .entry(conversation_id.to_owned())
            .or_default()
            .insert(conn_id)
    }

    /// Returns true if the connection was in the room.
    pub fn leave(&mut self, conn_id: ConnId, conversation_id: &str) -> bool {
        if let Some(rooms) = self.joined.get_mut(&conn_id) {
            rooms.remove(conversation_id);
            if rooms.is_empty() {
                self.joined.remove(&conn_id);
            }
        }
        self.remove_member(conn_id, conversation_id)
    }

    pub fn members_of(&self, conversation_id: &str) -> HashSet<ConnId> {
        self.rooms.get(conversation_id).cloned().unwrap_or_default()
    }

    /// Drops `conn_id` from every room it joined. Returns the rooms it left.
    pub fn remove_connection(&mut self, conn_id: ConnId) -> Vec<ConversationId> {
        let Some(rooms) = self.joined.remove(&conn_id) else {
            return Vec::new();
        };
        for conversation_id in &rooms {
            self.remove_member(conn_id, conversation_id);
        }
        rooms.into_iter().collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    fn remove_member(&mut self, conn_id: ConnId, conversation_id: &str) -> bool {
        let Some(members) = self.rooms.get_mut(conversation_id) else {
            return false;
        };
        let removed = members.remove(&conn_id);
        if members.is_empty() {
            self.rooms.remove(conversation_id);
        }
        removed
    }
}
