//! Call signaling state machine.
//!
//! `calling -> active -> ended`, or `calling -> ended` when declined, cancelled or left
//! ringing past the ring timeout. Ended sessions stay visible for a retention window so late
//! duplicate signals land on a known session, then they are purged. Every signal that names
//! an unknown session, or a session in the wrong state, is ignored.

mod session;

pub use session::{CallSession, CallStatus};

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    presence::ConnectionRegistry,
    protocol::{CallType, ConnId, EndReason, ServerEvent, SessionId},
};

#[derive(Default)]
pub struct CallManager {
    sessions: HashMap<SessionId, CallSession>,
    retention: HashMap<SessionId, CancellationToken>,
    ringing: HashMap<SessionId, CancellationToken>,
}

impl CallManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: SessionId) -> Option<&CallSession> {
        self.sessions.get(&session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Opens a `calling` session from the identity on `conn_id` to `receiver` and rings the
    /// receiver. Dropped when the caller is unannounced, the receiver is offline, or the two
    /// already share a live session.
    pub fn request(
        &mut self,
        registry: &ConnectionRegistry,
        conn_id: ConnId,
        conversation_id: &str,
        receiver: &str,
        call_type: CallType,
    ) -> Option<SessionId> {
        let Some(caller) = registry.owner_of(conn_id) else {
            debug!(%conn_id, "call request from unannounced connection");
            return None;
        };
        if caller == receiver {
            return None;
        }
        let Some(receiver_conn) = registry.find(receiver) else {
            debug!(caller, receiver, "call receiver offline");
            return None;
        };
        if self
            .sessions
            .values()
            .any(|s| s.is_live() && s.involves_pair(caller, receiver))
        {
            info!(caller, receiver, "call already in progress between pair");
            return None;
        }

        let session = CallSession::new(caller.clone(), receiver.to_owned(), conversation_id.to_owned(), call_type);
        let session_id = session.id;
        registry.send(
            receiver_conn,
            ServerEvent::CallIncoming {
                session_id,
                caller_id: session.caller.clone(),
                conversation_id: session.conversation_id.clone(),
                call_type,
            },
        );
        info!(%session_id, caller, receiver, ?call_type, "call ringing");
        self.sessions.insert(session_id, session);
        Some(session_id)
    }

    /// Receiver's answer to a ringing call. Returns the new status if it moved.
    pub fn respond(
        &mut self,
        registry: &ConnectionRegistry,
        conn_id: ConnId,
        session_id: SessionId,
        accepted: bool,
    ) -> Option<CallStatus> {
        let responder = registry.owner_of(conn_id)?;
        let Some(session) = self.sessions.get_mut(&session_id) else {
            debug!(%session_id, "response for unknown call");
            return None;
        };
        if session.receiver != *responder || session.status != CallStatus::Calling {
            debug!(%session_id, responder, status = ?session.status, "ignoring call response");
            return None;
        }

        stop(&mut self.ringing, session_id);
        if accepted {
            session.activate();
        } else {
            session.finish(Some(EndReason::Declined));
        }
        registry.send_to(&session.caller, ServerEvent::CallAccepted { session_id, accepted });
        info!(%session_id, accepted, "call answered");
        Some(session.status)
    }

    /// Hangup by either party. A ringing call is cancelled, an active one ends.
    pub fn end(&mut self, registry: &ConnectionRegistry, conn_id: ConnId, session_id: SessionId) -> Option<CallStatus> {
        let party = registry.owner_of(conn_id)?;
        let Some(session) = self.sessions.get_mut(&session_id) else {
            debug!(%session_id, "end for unknown call");
            return None;
        };
        if !session.is_live() || !session.is_party(party) {
            debug!(%session_id, party, "ignoring call end");
            return None;
        }

        let reason = match session.status {
            CallStatus::Calling => Some(EndReason::Cancelled),
            _ => None,
        };
        stop(&mut self.ringing, session_id);
        session.finish(reason);
        registry.send_to(session.peer_of(party), ServerEvent::CallEnded { session_id, reason });
        info!(%session_id, party, duration = ?session.duration(), "call ended");
        Some(session.status)
    }

    /// Ends every live session `identity` takes part in, telling the other side why.
    pub fn end_owned_by(&mut self, registry: &ConnectionRegistry, identity: &str) -> Vec<SessionId> {
        let mut ended = Vec::new();
        for session in self.sessions.values_mut() {
            if !session.is_live() || !session.is_party(identity) {
                continue;
            }
            let reason = Some(EndReason::PeerDisconnected);
            stop(&mut self.ringing, session.id);
            session.finish(reason);
            registry.send_to(
                session.peer_of(identity),
                ServerEvent::CallEnded { session_id: session.id, reason },
            );
            info!(session_id = %session.id, identity, "call dropped on disconnect");
            ended.push(session.id);
        }
        ended
    }

    /// Ends a call nobody answered in time, telling both sides. False if it already moved on.
    pub fn expire(&mut self, registry: &ConnectionRegistry, session_id: SessionId) -> bool {
        self.ringing.remove(&session_id);
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return false;
        };
        if session.status != CallStatus::Calling {
            return false;
        }

        let reason = Some(EndReason::Unanswered);
        session.finish(reason);
        for party in [&session.caller, &session.receiver] {
            registry.send_to(party, ServerEvent::CallEnded { session_id, reason });
        }
        info!(%session_id, "call unanswered");
        true
    }

    /// Registers the ring timer of a `calling` session. Cancelled once the call is answered or ends.
    pub fn ring_timer(&mut self, session_id: SessionId) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(old) = self.ringing.insert(session_id, token.clone()) {
            old.cancel();
        }
        token
    }

    /// Registers the retention timer of an ended session. Cancelled when the session is purged.
    pub fn retain(&mut self, session_id: SessionId) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(old) = self.retention.insert(session_id, token.clone()) {
            old.cancel();
        }
        token
    }

    pub fn purge(&mut self, session_id: SessionId) -> bool {
        stop(&mut self.retention, session_id);
        stop(&mut self.ringing, session_id);
        let purged = self.sessions.remove(&session_id).is_some();
        if purged {
            debug!(%session_id, "call session purged");
        }
        purged
    }

    /// Cancels every pending timer and forgets ended sessions.
    pub fn purge_ended(&mut self) {
        for (_, token) in self.retention.drain().chain(self.ringing.drain()) {
            token.cancel();
        }
        self.sessions.retain(|_, s| s.is_live());
    }
}

fn stop(timers: &mut HashMap<SessionId, CancellationToken>, session_id: SessionId) {
    if let Some(token) = timers.remove(&session_id) {
        token.cancel();
    }
}
