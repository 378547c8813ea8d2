//! Owns all live state and applies one client event at a time.
//!
//! Registry, rooms and call sessions sit behind a single lock. Handlers never await while
//! holding it; the only slow step, participant lookup during fanout, runs before the lock
//! is taken.

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    calls::{CallManager, CallSession, CallStatus},
    config::Config,
    notify,
    participants::{self, ParticipantResolver},
    presence::{self, ConnectionRegistry, EventSender},
    protocol::{ClientEvent, ConnId, Identity, Message, ServerEvent, SessionId},
    rooms::{self, RoomMembership},
};

#[derive(Debug, Clone, Copy)]
pub struct HubSettings {
    pub call_retention: Duration,
    pub call_ring_timeout: Duration,
    pub participant_timeout: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            call_retention: Duration::from_secs(60),
            call_ring_timeout: Duration::from_secs(45),
            participant_timeout: Duration::from_secs(2),
        }
    }
}

impl From<&Config> for HubSettings {
    fn from(config: &Config) -> Self {
        Self {
            call_retention: config.call_retention,
            call_ring_timeout: config.call_ring_timeout,
            participant_timeout: config.participant_timeout,
        }
    }
}

#[derive(Default)]
struct HubState {
    registry: ConnectionRegistry,
    rooms: RoomMembership,
    calls: CallManager,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub connections: usize,
    pub online_users: usize,
    pub rooms: usize,
    pub call_sessions: usize,
}

#[derive(Clone)]
pub struct Hub {
    state: Arc<Mutex<HubState>>,
    participants: Arc<dyn ParticipantResolver>,
    settings: HubSettings,
}

impl Hub {
    pub fn new(participants: Arc<dyn ParticipantResolver>, settings: HubSettings) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState::default())),
            participants,
            settings,
        }
    }

    pub fn participants(&self) -> &Arc<dyn ParticipantResolver> {
        &self.participants
    }

    pub fn settings(&self) -> HubSettings {
        self.settings
    }

    pub async fn connect(&self, conn_id: ConnId, tx: EventSender) {
        self.state.lock().await.registry.register(conn_id, tx);
        debug!(%conn_id, "connected");
    }

    pub async fn handle(&self, conn_id: ConnId, event: ClientEvent) {
        if let ClientEvent::MessageSend(msg) = event {
            self.deliver(conn_id, msg).await;
            return;
        }

        let mut state = self.state.lock().await;
        let HubState { registry, rooms, calls } = &mut *state;

        match event {
            ClientEvent::IdentityAnnounce { identity } => {
                let announced = registry.announce(conn_id, &identity);
                if let Some(previous) = announced.went_offline {
                    presence::broadcast_presence(registry, &previous, false);
                    for session_id in calls.end_owned_by(registry, &previous) {
                        self.schedule_purge(calls, session_id);
                    }
                }
                if announced.recorded {
                    info!(%conn_id, identity, "identity announced");
                    presence::broadcast_presence(registry, &identity, true);
                    registry.send(
                        conn_id,
                        ServerEvent::OnlineUsers { identities: registry.online_identities() },
                    );
                }
            }
            ClientEvent::StatusUpdate { is_online } => match registry.owner_of(conn_id) {
                Some(identity) => presence::broadcast_presence(registry, identity, is_online),
                None => debug!(%conn_id, "status update from unannounced connection"),
            },
            ClientEvent::NotifyRequest { target_identity, data } => {
                if let Some(id) = notify::notify(registry, &target_identity, data) {
                    debug!(%id, target = target_identity, "notification delivered");
                }
            }
            ClientEvent::CallRequest { conversation_id, receiver_id, call_type } => {
                if let Some(session_id) = calls.request(registry, conn_id, &conversation_id, &receiver_id, call_type) {
                    self.schedule_ring_timeout(calls, session_id);
                }
            }
            ClientEvent::CallResponse { session_id, accepted, .. } => {
                if calls.respond(registry, conn_id, session_id, accepted) == Some(CallStatus::Ended) {
                    self.schedule_purge(calls, session_id);
                }
            }
            ClientEvent::CallEnd { session_id, .. } => {
                if calls.end(registry, conn_id, session_id) == Some(CallStatus::Ended) {
                    self.schedule_purge(calls, session_id);
                }
            }
            ClientEvent::RoomJoin { conversation_id } => {
                if rooms.join(conn_id, &conversation_id) {
                    debug!(%conn_id, conversation_id, "joined room");
                }
            }
            ClientEvent::RoomLeave { conversation_id } => {
                if rooms.leave(conn_id, &conversation_id) {
                    debug!(%conn_id, conversation_id, "left room");
                }
            }
            ClientEvent::MessageSend(_) => unreachable!("handled before locking"),
        }
    }

    /// Sends `error` back to one connection, for frames rejected before reaching [`Hub::handle`].
    pub async fn reject(&self, conn_id: ConnId, message: String) {
        self.state.lock().await.registry.send(conn_id, ServerEvent::Error { message });
    }

    pub async fn disconnect(&self, conn_id: ConnId) {
        let mut state = self.state.lock().await;
        let HubState { registry, rooms, calls } = &mut *state;

        // calls follow the identity, so they survive while another of its connections is up
        let gone = registry.unregister(conn_id);
        if let (Some(identity), true) = (gone.identity, gone.went_offline) {
            presence::broadcast_presence(registry, &identity, false);
            for session_id in calls.end_owned_by(registry, &identity) {
                self.schedule_purge(calls, session_id);
            }
        }
        let left = rooms.remove_connection(conn_id);
        debug!(%conn_id, rooms = left.len(), "disconnected");
    }

    /// Fanout of one message to its conversation, each target connection at most once.
    async fn deliver(&self, conn_id: ConnId, msg: Message) {
        let participants = match participants::resolve_within(
            self.participants.as_ref(),
            &msg.conversation_id,
            self.settings.participant_timeout,
        )
        .await
        {
            Ok(participants) => participants,
            Err(err) => {
                warn!(conversation_id = %msg.conversation_id, %err, "participant lookup failed, room delivery only");
                Vec::new()
            }
        };

        let state = self.state.lock().await;
        let targets = rooms::fanout_targets(&state.registry, &state.rooms, conn_id, &msg.conversation_id, &participants);
        let delivered = rooms::send_msg(&state.registry, &targets, &msg);
        debug!(%conn_id, conversation_id = %msg.conversation_id, delivered, "message fanned out");
    }

    fn schedule_purge(&self, calls: &mut CallManager, session_id: SessionId) {
        schedule_purge(&self.state, calls, session_id, self.settings.call_retention);
    }

    fn schedule_ring_timeout(&self, calls: &mut CallManager, session_id: SessionId) {
        let token = calls.ring_timer(session_id);
        let state = Arc::clone(&self.state);
        let HubSettings { call_ring_timeout, call_retention, .. } = self.settings;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(call_ring_timeout) => {
                    let mut guard = state.lock().await;
                    let HubState { registry, calls, .. } = &mut *guard;
                    if calls.expire(registry, session_id) {
                        schedule_purge(&state, calls, session_id, call_retention);
                    }
                }
            }
        });
    }

    pub async fn call_session(&self, session_id: SessionId) -> Option<CallSession> {
        self.state.lock().await.calls.get(session_id).cloned()
    }

    pub async fn online_status(&self, identities: Vec<Identity>) -> Vec<(Identity, bool)> {
        let state = self.state.lock().await;
        identities
            .into_iter()
            .map(|identity| {
                let online = state.registry.is_online(&identity);
                (identity, online)
            })
            .collect()
    }

    pub async fn stats(&self) -> HubStats {
        let state = self.state.lock().await;
        HubStats {
            connections: state.registry.connection_count(),
            online_users: state.registry.online_identities().len(),
            rooms: state.rooms.room_count(),
            call_sessions: state.calls.len(),
        }
    }

    /// Cancels pending retention timers. Live calls are left to their connections' teardown.
    pub async fn shutdown(&self) {
        self.state.lock().await.calls.purge_ended();
        info!("hub shut down");
    }
}

fn schedule_purge(state: &Arc<Mutex<HubState>>, calls: &mut CallManager, session_id: SessionId, retention: Duration) {
    let token = calls.retain(session_id);
    let state = Arc::clone(state);
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(retention) => {
                state.lock().await.calls.purge(session_id);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use serde_json::{json, Map};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::*;
    use crate::{
        participants::ResolveError,
        protocol::{CallType, EndReason},
    };

    type Inbox = mpsc::UnboundedReceiver<ServerEvent>;

    #[derive(Default)]
    struct StaticParticipants(HashMap<String, Vec<Identity>>);

    #[async_trait]
    impl ParticipantResolver for StaticParticipants {
        async fn list_participants(&self, conversation_id: &str) -> Result<Vec<Identity>, ResolveError> {
            Ok(self.0.get(conversation_id).cloned().unwrap_or_default())
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl ParticipantResolver for BrokenStore {
        async fn list_participants(&self, _: &str) -> Result<Vec<Identity>, ResolveError> {
            Err(ResolveError::Database(sqlx::Error::PoolClosed))
        }
    }

    fn hub() -> Hub {
        Hub::new(Arc::new(StaticParticipants::default()), HubSettings::default())
    }

    fn drain(rx: &mut Inbox) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn connect(hub: &Hub) -> (ConnId, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = Uuid::now_v7();
        hub.connect(conn_id, tx).await;
        (conn_id, rx)
    }

    async fn online(hub: &Hub, identity: &str) -> (ConnId, Inbox) {
        let (conn_id, rx) = connect(hub).await;
        hub.handle(conn_id, ClientEvent::IdentityAnnounce { identity: identity.into() }).await;
        (conn_id, rx)
    }

    fn presence(identity: &str, is_online: bool) -> ServerEvent {
        ServerEvent::PresenceChanged { identity: identity.into(), is_online }
    }

    fn message(conversation_id: &str, text: &str) -> Message {
        let mut payload = Map::new();
        payload.insert("text".into(), json!(text));
        Message { conversation_id: conversation_id.into(), payload }
    }

    async fn ring(hub: &Hub, a: ConnId, b_rx: &mut Inbox) -> Option<SessionId> {
        hub.handle(
            a,
            ClientEvent::CallRequest {
                conversation_id: "c7".into(),
                receiver_id: "bob".into(),
                call_type: CallType::Audio,
            },
        )
        .await;
        drain(b_rx).into_iter().find_map(|event| match event {
            ServerEvent::CallIncoming { session_id, .. } => Some(session_id),
            _ => None,
        })
    }

    async fn active_call(hub: &Hub, a: ConnId, b: ConnId, b_rx: &mut Inbox) -> SessionId {
        let session_id = ring(hub, a, b_rx).await.unwrap();
        hub.handle(b, ClientEvent::CallResponse { session_id, accepted: true, caller_id: None }).await;
        session_id
    }

    #[tokio::test]
    async fn announce_broadcasts_presence_once() {
        let hub = hub();
        let (_, mut watcher) = online(&hub, "watcher").await;
        let (alice, mut alice_rx) = online(&hub, "alice").await;
        drain(&mut watcher);

        hub.handle(alice, ClientEvent::IdentityAnnounce { identity: "alice".into() }).await;

        assert!(drain(&mut watcher).is_empty());
        let events = drain(&mut alice_rx);
        assert_eq!(events[0], presence("alice", true));
        assert!(matches!(&events[1], ServerEvent::OnlineUsers { identities } if identities.len() == 2));
    }

    #[tokio::test]
    async fn disconnect_broadcasts_offline_once() {
        let hub = hub();
        let (_, mut watcher) = online(&hub, "watcher").await;
        let (alice, _) = online(&hub, "alice").await;
        drain(&mut watcher);

        hub.disconnect(alice).await;
        hub.disconnect(alice).await;

        assert_eq!(drain(&mut watcher), vec![presence("alice", false)]);
        assert_eq!(hub.online_status(vec!["alice".into()]).await, vec![("alice".to_owned(), false)]);
    }

    #[tokio::test]
    async fn status_update_rebroadcasts_flag() {
        let hub = hub();
        let (_, mut watcher) = online(&hub, "watcher").await;
        let (alice, _) = online(&hub, "alice").await;
        let (stranger, _) = connect(&hub).await;
        drain(&mut watcher);

        hub.handle(alice, ClientEvent::StatusUpdate { is_online: false }).await;
        hub.handle(stranger, ClientEvent::StatusUpdate { is_online: true }).await;

        assert_eq!(drain(&mut watcher), vec![presence("alice", false)]);
    }

    #[tokio::test]
    async fn notification_reaches_online_target() {
        let hub = hub();
        let (alice, _) = online(&hub, "alice").await;
        let (_, mut bob_rx) = online(&hub, "bob").await;
        drain(&mut bob_rx);

        let mut data = Map::new();
        data.insert("kind".into(), json!("like"));
        hub.handle(alice, ClientEvent::NotifyRequest { target_identity: "bob".into(), data: data.clone() }).await;
        hub.handle(alice, ClientEvent::NotifyRequest { target_identity: "carol".into(), data }).await;

        let events = drain(&mut bob_rx);
        assert_eq!(events.len(), 1);
        let ServerEvent::NotificationReceived(notification) = &events[0] else {
            panic!("expected notification, got {events:?}");
        };
        assert_eq!(notification.data.get("kind"), Some(&json!("like")));
    }

    #[tokio::test]
    async fn fanout_reaches_room_and_participants_once() {
        let participants = StaticParticipants(HashMap::from([(
            "c9".to_owned(),
            vec!["u1".to_owned(), "u2".to_owned(), "uy".to_owned()],
        )]));
        let hub = Hub::new(Arc::new(participants), HubSettings::default());
        let (x, mut x_rx) = online(&hub, "ux").await;
        let (y, mut y_rx) = online(&hub, "uy").await;
        let (_, mut z_rx) = online(&hub, "u2").await;
        for conn in [x, y] {
            hub.handle(conn, ClientEvent::RoomJoin { conversation_id: "c9".into() }).await;
        }
        drain(&mut x_rx);
        drain(&mut y_rx);
        drain(&mut z_rx);

        let msg = message("c9", "hello");
        hub.handle(x, ClientEvent::MessageSend(msg.clone())).await;

        assert!(drain(&mut x_rx).is_empty());
        assert_eq!(drain(&mut y_rx), vec![ServerEvent::MessageReceived(msg.clone())]);
        assert_eq!(drain(&mut z_rx), vec![ServerEvent::MessageReceived(msg)]);
    }

    #[tokio::test]
    async fn store_failure_degrades_to_room_delivery() {
        let hub = Hub::new(Arc::new(BrokenStore), HubSettings::default());
        let (x, _) = connect(&hub).await;
        let (y, mut y_rx) = connect(&hub).await;
        hub.handle(y, ClientEvent::RoomJoin { conversation_id: "c9".into() }).await;

        let msg = message("c9", "still here");
        hub.handle(x, ClientEvent::MessageSend(msg.clone())).await;

        assert_eq!(drain(&mut y_rx), vec![ServerEvent::MessageReceived(msg)]);
    }

    #[tokio::test]
    async fn left_room_gets_nothing() {
        let hub = hub();
        let (x, _) = connect(&hub).await;
        let (y, mut y_rx) = connect(&hub).await;
        hub.handle(y, ClientEvent::RoomJoin { conversation_id: "c9".into() }).await;
        hub.handle(y, ClientEvent::RoomLeave { conversation_id: "c9".into() }).await;

        hub.handle(x, ClientEvent::MessageSend(message("c9", "anyone?"))).await;

        assert!(drain(&mut y_rx).is_empty());
        assert_eq!(hub.stats().await.rooms, 0);
    }

    #[tokio::test]
    async fn declined_call_reports_to_caller() {
        let hub = hub();
        let (a, mut a_rx) = online(&hub, "alice").await;
        let (b, mut b_rx) = online(&hub, "bob").await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        hub.handle(
            a,
            ClientEvent::CallRequest {
                conversation_id: "c7".into(),
                receiver_id: "bob".into(),
                call_type: CallType::Audio,
            },
        )
        .await;
        let incoming = drain(&mut b_rx);
        assert_eq!(incoming.len(), 1);
        let ServerEvent::CallIncoming { session_id, caller_id, conversation_id, call_type } = incoming[0].clone() else {
            panic!("expected incoming call, got {incoming:?}");
        };
        assert_eq!((caller_id.as_str(), conversation_id.as_str(), call_type), ("alice", "c7", CallType::Audio));

        hub.handle(b, ClientEvent::CallResponse { session_id, accepted: false, caller_id: Some("alice".into()) })
            .await;

        assert_eq!(drain(&mut a_rx), vec![ServerEvent::CallAccepted { session_id, accepted: false }]);
        let session = hub.call_session(session_id).await.unwrap();
        assert_eq!(session.status, CallStatus::Ended);
        assert_eq!(session.duration(), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn peer_disconnect_ends_active_call() {
        let hub = hub();
        let (a, mut a_rx) = online(&hub, "alice").await;
        let (b, mut b_rx) = online(&hub, "bob").await;
        let session_id = active_call(&hub, a, b, &mut b_rx).await;
        drain(&mut a_rx);

        hub.disconnect(b).await;

        let events = drain(&mut a_rx);
        assert!(events.contains(&ServerEvent::CallEnded {
            session_id,
            reason: Some(EndReason::PeerDisconnected),
        }));
        assert_eq!(hub.call_session(session_id).await.unwrap().status, CallStatus::Ended);
    }

    #[tokio::test]
    async fn call_survives_while_peer_has_another_connection() {
        let hub = hub();
        let (a, mut a_rx) = online(&hub, "alice").await;
        let (b, mut b_rx) = online(&hub, "bob").await;
        let (b2, _) = online(&hub, "bob").await;
        let session_id = active_call(&hub, a, b, &mut b_rx).await;
        drain(&mut a_rx);

        hub.disconnect(b).await;
        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(hub.call_session(session_id).await.unwrap().status, CallStatus::Active);

        hub.disconnect(b2).await;
        let events = drain(&mut a_rx);
        assert!(events.contains(&ServerEvent::CallEnded {
            session_id,
            reason: Some(EndReason::PeerDisconnected),
        }));
        assert_eq!(hub.call_session(session_id).await.unwrap().status, CallStatus::Ended);
    }

    #[tokio::test]
    async fn reannounce_ends_calls_of_abandoned_identity() {
        let hub = hub();
        let (a, mut a_rx) = online(&hub, "alice").await;
        let (b, mut b_rx) = online(&hub, "bob").await;
        let session_id = active_call(&hub, a, b, &mut b_rx).await;
        drain(&mut a_rx);

        hub.handle(a, ClientEvent::IdentityAnnounce { identity: "carol".into() }).await;

        let events = drain(&mut b_rx);
        assert!(events.contains(&presence("alice", false)));
        assert!(events.contains(&ServerEvent::CallEnded {
            session_id,
            reason: Some(EndReason::PeerDisconnected),
        }));
        assert_eq!(hub.call_session(session_id).await.unwrap().status, CallStatus::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_times_out_and_frees_the_pair() {
        let hub = hub();
        let (a, mut a_rx) = online(&hub, "alice").await;
        let (_, mut b_rx) = online(&hub, "bob").await;
        drain(&mut a_rx);
        let session_id = ring(&hub, a, &mut b_rx).await.unwrap();

        tokio::time::sleep(Duration::from_secs(44)).await;
        assert_eq!(hub.call_session(session_id).await.unwrap().status, CallStatus::Calling);
        assert!(ring(&hub, a, &mut b_rx).await.is_none());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let ended = ServerEvent::CallEnded { session_id, reason: Some(EndReason::Unanswered) };
        assert_eq!(drain(&mut a_rx), vec![ended.clone()]);
        assert_eq!(drain(&mut b_rx), vec![ended]);
        let session = hub.call_session(session_id).await.unwrap();
        assert_eq!(session.status, CallStatus::Ended);
        assert_eq!(session.end_reason, Some(EndReason::Unanswered));

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(hub.call_session(session_id).await.is_none());
        let retry = ring(&hub, a, &mut b_rx).await;
        assert!(retry.is_some_and(|id| id != session_id));
    }

    #[tokio::test(start_paused = true)]
    async fn ended_session_is_retained_then_purged() {
        let hub = hub();
        let (a, mut a_rx) = online(&hub, "alice").await;
        let (b, mut b_rx) = online(&hub, "bob").await;
        let session_id = active_call(&hub, a, b, &mut b_rx).await;
        hub.handle(a, ClientEvent::CallEnd { session_id, receiver_id: Some("bob".into()) }).await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        tokio::time::sleep(Duration::from_secs(30)).await;
        hub.handle(a, ClientEvent::CallEnd { session_id, receiver_id: Some("bob".into()) }).await;
        assert!(drain(&mut b_rx).is_empty());
        assert_eq!(hub.call_session(session_id).await.unwrap().status, CallStatus::Ended);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(hub.call_session(session_id).await.is_none());

        hub.handle(b, ClientEvent::CallResponse { session_id, accepted: true, caller_id: None }).await;
        assert!(drain(&mut a_rx).is_empty());
    }

    #[tokio::test]
    async fn shutdown_drops_ended_sessions() {
        let hub = hub();
        let (a, _) = online(&hub, "alice").await;
        let (b, mut b_rx) = online(&hub, "bob").await;
        let session_id = active_call(&hub, a, b, &mut b_rx).await;
        hub.handle(b, ClientEvent::CallEnd { session_id, receiver_id: None }).await;

        hub.shutdown().await;

        assert!(hub.call_session(session_id).await.is_none());
        assert_eq!(hub.stats().await.call_sessions, 0);
    }
}
