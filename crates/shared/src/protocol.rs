use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{CallId, MessageId, MessageKind, ThreadId, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
}

/// Per-thread context pushed alongside `message_received` so a client can
/// update its badge without a refetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub thread_id: ThreadId,
    pub unread_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub thread_id: ThreadId,
    pub participants: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: i64,
}

/// Opaque display fields sourced from the relationship store; this core does
/// not interpret them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendProfile {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FriendEventKind {
    RequestSent,
    RequestAccepted,
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallOfferPayload {
    pub call_id: CallId,
    pub sdp: String,
    pub is_video: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallAnswerPayload {
    pub call_id: CallId,
    pub sdp: String,
}

/// ICE candidates are relayed verbatim; their shape belongs to the media
/// transport, not to this core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub call_id: CallId,
    pub candidate: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEndReason {
    Hangup,
    Timeout,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEndPayload {
    pub call_id: CallId,
    pub reason: CallEndReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRejectPayload {
    pub call_id: CallId,
}

/// Events pushed over a bound channel. The serde tag yields exactly the event
/// names the presentation layer consumes (`message_received`, `call_offer`,
/// ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageReceived {
        message: MessagePayload,
        thread: ThreadInfo,
    },
    MessageSent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temp_id: Option<String>,
        message: MessagePayload,
    },
    MessagesRead {
        thread_id: ThreadId,
        read_by: UserId,
        read_at: DateTime<Utc>,
        count: i64,
    },
    FriendRequestReceived {
        from: FriendProfile,
        created_at: DateTime<Utc>,
    },
    FriendRequestAccepted {
        by: FriendProfile,
        timestamp: DateTime<Utc>,
    },
    FriendRemoved {
        by: UserId,
        timestamp: DateTime<Utc>,
    },
    UserOnline {
        user_id: UserId,
        timestamp: DateTime<Utc>,
    },
    UserOffline {
        user_id: UserId,
        timestamp: DateTime<Utc>,
    },
    CallOffer {
        from: UserId,
        to: UserId,
        payload: CallOfferPayload,
    },
    CallAnswer {
        from: UserId,
        to: UserId,
        payload: CallAnswerPayload,
    },
    CallIceCandidate {
        from: UserId,
        to: UserId,
        payload: IceCandidatePayload,
    },
    CallEnded {
        from: UserId,
        to: UserId,
        payload: CallEndPayload,
    },
    CallRejected {
        from: UserId,
        to: UserId,
        payload: CallRejectPayload,
    },
    Error(ApiError),
}

/// Frames a connected client sends over its channel. Signaling only: message
/// send/read go through the HTTP surface where persistence is authoritative.
/// `from` is never part of a frame; the server stamps the bound identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    CallOffer {
        to: UserId,
        offer: CallOfferPayload,
    },
    CallAnswer {
        to: UserId,
        answer: CallAnswerPayload,
    },
    CallIceCandidate {
        to: UserId,
        candidate: IceCandidatePayload,
    },
    CallEnded {
        to: UserId,
        end: CallEndPayload,
    },
    CallRejected {
        to: UserId,
        reject: CallRejectPayload,
    },
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
