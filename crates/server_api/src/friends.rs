use chrono::{DateTime, Utc};
use registry::ChannelRegistry;
use serde::Deserialize;
use shared::{
    domain::UserId,
    protocol::{FriendEventKind, FriendProfile, ServerEvent},
};
use tracing::debug;

/// A relationship mutation reported by the friend-graph store. `actor` is
/// the party that performed the mutation; `other_party` is the identity to
/// notify. Display fields inside `actor` are opaque to this core.
#[derive(Debug, Clone, Deserialize)]
pub struct FriendEventNotice {
    pub kind: FriendEventKind,
    pub actor: FriendProfile,
    pub other_party: UserId,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Pushes the relationship change to the other party's bound channels.
/// Stateless: the friend graph itself lives in an external collaborator, and
/// an offline recipient simply reconciles from it on next fetch.
pub async fn relay_friend_event(registry: &ChannelRegistry, notice: FriendEventNotice) {
    let event = match notice.kind {
        FriendEventKind::RequestSent => ServerEvent::FriendRequestReceived {
            from: notice.actor,
            created_at: notice.timestamp,
        },
        FriendEventKind::RequestAccepted => ServerEvent::FriendRequestAccepted {
            by: notice.actor,
            timestamp: notice.timestamp,
        },
        FriendEventKind::Removed => ServerEvent::FriendRemoved {
            by: notice.actor.user_id,
            timestamp: notice.timestamp,
        },
    };

    let delivered = registry.send(&notice.other_party, event).await;
    if delivered == 0 {
        debug!(recipient = %notice.other_party, "friend event recipient offline");
    }
}
