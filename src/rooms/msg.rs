use std::collections::HashSet;

use tracing::debug;

use crate::{
    presence::ConnectionRegistry,
    protocol::{ConnId, Identity, Message, ServerEvent},
};

use super::RoomMembership;

/// Connections a message in `conversation_id` goes to: everyone in the room plus the first
/// connection of every online participant, minus the sender's own connection.
///
/// Both sources are merged into one set so a connection that is room-joined and also a
/// participant's connection gets a single copy.
pub(crate) fn fanout_targets(
    registry: &ConnectionRegistry,
    rooms: &RoomMembership,
    sender: ConnId,
    conversation_id: &str,
    participants: &[Identity],
) -> HashSet<ConnId> {
    let mut targets = rooms.members_of(conversation_id);
    targets.extend(participants.iter().filter_map(|identity| registry.find(identity)));
    targets.remove(&sender);
    targets
}

/// Returns how many connections the message was queued on.
pub(crate) fn send_msg(registry: &ConnectionRegistry, targets: &HashSet<ConnId>, msg: &Message) -> usize {
    let mut delivered = 0;
    for conn_id in targets {
        if registry.send(*conn_id, ServerEvent::MessageReceived(msg.clone())) {
            delivered += 1;
        } else {
            debug!(%conn_id, "fanout target vanished");
        }
    }
    delivered
}
