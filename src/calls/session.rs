use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::Instant;

use crate::protocol::{CallType, ConversationId, EndReason, Identity, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Calling,
    Active,
    Ended,
}

#[derive(Debug, Clone)]
pub struct CallSession {
    pub id: SessionId,
    pub caller: Identity,
    pub receiver: Identity,
    pub conversation_id: ConversationId,
    pub call_type: CallType,
    pub started_at: OffsetDateTime,
    pub status: CallStatus,
    pub end_reason: Option<EndReason>,
    answered_at: Option<Instant>,
    duration: Option<Duration>,
}

impl CallSession {
    pub fn new(caller: Identity, receiver: Identity, conversation_id: ConversationId, call_type: CallType) -> Self {
        Self {
            id: SessionId::now_v7(),
            caller,
            receiver,
            conversation_id,
            call_type,
            started_at: OffsetDateTime::now_utc(),
            status: CallStatus::Calling,
            end_reason: None,
            answered_at: None,
            duration: None,
        }
    }

    pub fn is_party(&self, identity: &str) -> bool {
        self.caller == identity || self.receiver == identity
    }

    pub fn involves_pair(&self, a: &str, b: &str) -> bool {
        (self.caller == a && self.receiver == b) || (self.caller == b && self.receiver == a)
    }

    /// The participant on the other end from `identity`.
    pub fn peer_of(&self, identity: &str) -> &Identity {
        if self.caller == identity { &self.receiver } else { &self.caller }
    }

    pub fn is_live(&self) -> bool {
        self.status != CallStatus::Ended
    }

    pub(crate) fn activate(&mut self) {
        self.status = CallStatus::Active;
        self.answered_at = Some(Instant::now());
    }

    pub(crate) fn finish(&mut self, reason: Option<EndReason>) {
        self.duration = Some(self.answered_at.map(|at| at.elapsed()).unwrap_or_default());
        self.status = CallStatus::Ended;
        self.end_reason = reason;
    }

    /// Talk time. Zero for calls that were never answered, `None` while still running.
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }
}
