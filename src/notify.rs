use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::{
    presence::ConnectionRegistry,
    protocol::{Notification, ServerEvent},
};

/// Point-to-point delivery to the first connection of `target`. Offline targets lose the
/// notification; keeping it is up to whoever persisted it.
pub fn notify(registry: &ConnectionRegistry, target: &str, data: Map<String, Value>) -> Option<Uuid> {
    let Some(conn_id) = registry.find(target) else {
        debug!(target, "notification dropped, target offline");
        return None;
    };

    let id = Uuid::now_v7();
    registry
        .send(conn_id, ServerEvent::NotificationReceived(Notification { id, data }))
        .then_some(id)
}
