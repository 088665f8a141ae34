use std::sync::Arc;

use chrono::Utc;
use registry::{ChannelHandle, ChannelRegistry};
use serde::Deserialize;
use shared::{
    domain::{MessageId, MessageKind, ThreadId, UserId},
    error::CoreError,
    protocol::{MessagePayload, ServerEvent, ThreadInfo, ThreadSummary},
};
use storage::{Storage, StoredMessage};
use tracing::debug;

mod friends;
pub use friends::{relay_friend_event, FriendEventNotice};

pub const MAX_TEXT_MESSAGE_CHARS: usize = 2000;
pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Dependency bundle for the messaging engine. The registry is handed in at
/// construction: "registry not yet initialized" is a wiring bug, not a
/// runtime condition checked at call sites.
#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub registry: Arc<ChannelRegistry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewMessage {
    pub receiver_id: UserId,
    pub body: String,
    #[serde(default = "default_kind")]
    pub kind: MessageKind,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    /// Client-side correlation id echoed back in `message_sent`.
    #[serde(default)]
    pub temp_id: Option<String>,
}

fn default_kind() -> MessageKind {
    MessageKind::Text
}

/// Validates, persists and then best-effort pushes. Persistence is
/// authoritative: a receiver with no bound channel still gets a successful
/// send, and reconciles on its next fetch.
pub async fn send_message(
    ctx: &ApiContext,
    sender: &UserId,
    request: NewMessage,
    origin: Option<ChannelHandle>,
) -> Result<MessagePayload, CoreError> {
    validate_content(&request)?;
    let thread_id = ThreadId::between(sender, &request.receiver_id)?;

    ctx.storage
        .get_or_create_thread(sender, &request.receiver_id)
        .await
        .map_err(CoreError::Storage)?;
    let outcome = ctx
        .storage
        .append_message(
            &thread_id,
            sender,
            &request.receiver_id,
            request.body.trim(),
            request.kind,
            request.metadata.as_ref(),
        )
        .await
        .map_err(CoreError::Storage)?;

    let message = message_payload(outcome.message);

    let delivered = ctx
        .registry
        .send(
            &request.receiver_id,
            ServerEvent::MessageReceived {
                message: message.clone(),
                thread: ThreadInfo {
                    thread_id: thread_id.clone(),
                    unread_count: outcome.receiver_unread,
                },
            },
        )
        .await;
    if delivered == 0 {
        debug!(receiver = %request.receiver_id, thread = %thread_id, "receiver offline, push skipped");
    }

    let echo = ServerEvent::MessageSent {
        temp_id: request.temp_id,
        message: message.clone(),
    };
    match origin {
        Some(handle) => {
            ctx.registry.send_except(sender, handle, echo).await;
        }
        None => {
            ctx.registry.send(sender, echo).await;
        }
    }

    Ok(message)
}

/// Transitions read state and, only when something actually transitioned,
/// notifies the other participant so delivery ticks can update.
pub async fn mark_as_read(
    ctx: &ApiContext,
    reader: &UserId,
    thread_id: &ThreadId,
    message_id: Option<MessageId>,
) -> Result<i64, CoreError> {
    let thread = ensure_participant(ctx, reader, thread_id).await?;

    let transitioned = ctx
        .storage
        .mark_read(thread_id, reader, message_id)
        .await
        .map_err(CoreError::Storage)?;

    if message_id.is_some() && transitioned == 0 {
        // Missing, foreign, already read or soft-deleted: indistinguishable
        // by design for a targeted transition.
        return Err(CoreError::MessageNotFound);
    }

    if transitioned > 0 {
        if let Some(other) = thread.other_participant(reader) {
            ctx.registry
                .send(
                    other,
                    ServerEvent::MessagesRead {
                        thread_id: thread_id.clone(),
                        read_by: reader.clone(),
                        read_at: Utc::now(),
                        count: transitioned,
                    },
                )
                .await;
        }
    }

    Ok(transitioned)
}

pub async fn list_messages(
    ctx: &ApiContext,
    caller: &UserId,
    thread_id: &ThreadId,
    limit: u32,
    before: Option<MessageId>,
) -> Result<Vec<MessagePayload>, CoreError> {
    ensure_participant(ctx, caller, thread_id).await?;
    let limit = limit.clamp(1, MAX_PAGE_SIZE);
    let messages = ctx
        .storage
        .list_messages(thread_id, limit, before)
        .await
        .map_err(CoreError::Storage)?;
    Ok(messages.into_iter().map(message_payload).collect())
}

pub async fn list_threads(
    ctx: &ApiContext,
    caller: &UserId,
) -> Result<Vec<ThreadSummary>, CoreError> {
    let overviews = ctx
        .storage
        .threads_for_user(caller)
        .await
        .map_err(CoreError::Storage)?;
    Ok(overviews
        .into_iter()
        .map(|overview| ThreadSummary {
            thread_id: overview.thread.thread_id.clone(),
            participants: overview
                .thread
                .participants()
                .into_iter()
                .cloned()
                .collect(),
            last_message: overview.last_message.map(message_payload),
            last_message_at: overview.thread.last_message_at,
            unread_count: overview.unread_count,
        })
        .collect())
}

pub async fn edit_message(
    ctx: &ApiContext,
    sender: &UserId,
    message_id: MessageId,
    body: String,
) -> Result<MessagePayload, CoreError> {
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed.chars().count() > MAX_TEXT_MESSAGE_CHARS {
        return Err(CoreError::InvalidArgument(
            "message body must be 1..=2000 characters".to_string(),
        ));
    }
    let edited = ctx
        .storage
        .edit_message(message_id, sender, trimmed)
        .await
        .map_err(CoreError::Storage)?
        .ok_or(CoreError::MessageNotFound)?;
    Ok(message_payload(edited))
}

pub async fn delete_message(
    ctx: &ApiContext,
    sender: &UserId,
    message_id: MessageId,
) -> Result<(), CoreError> {
    let deleted = ctx
        .storage
        .delete_message(message_id, sender)
        .await
        .map_err(CoreError::Storage)?;
    if !deleted {
        return Err(CoreError::MessageNotFound);
    }
    Ok(())
}

async fn ensure_participant(
    ctx: &ApiContext,
    caller: &UserId,
    thread_id: &ThreadId,
) -> Result<storage::StoredThread, CoreError> {
    let thread = ctx
        .storage
        .thread(thread_id)
        .await
        .map_err(CoreError::Storage)?
        .ok_or_else(|| CoreError::ThreadAccessDenied(thread_id.to_string()))?;
    if !thread.has_participant(caller) {
        return Err(CoreError::ThreadAccessDenied(thread_id.to_string()));
    }
    Ok(thread)
}

fn validate_content(request: &NewMessage) -> Result<(), CoreError> {
    let trimmed = request.body.trim();
    match request.kind {
        MessageKind::Text => {
            if trimmed.is_empty() {
                return Err(CoreError::InvalidArgument(
                    "text message body cannot be empty".to_string(),
                ));
            }
            if trimmed.chars().count() > MAX_TEXT_MESSAGE_CHARS {
                return Err(CoreError::InvalidArgument(format!(
                    "text message exceeds {MAX_TEXT_MESSAGE_CHARS} characters"
                )));
            }
        }
        MessageKind::Image | MessageKind::File => {
            if request.metadata.is_none() {
                return Err(CoreError::InvalidArgument(format!(
                    "{} messages require metadata",
                    request.kind.as_str()
                )));
            }
        }
    }
    Ok(())
}

fn message_payload(message: StoredMessage) -> MessagePayload {
    MessagePayload {
        id: message.id,
        thread_id: message.thread_id,
        sender_id: message.sender_id,
        receiver_id: message.receiver_id,
        body: message.body,
        kind: message.kind,
        metadata: message.metadata,
        created_at: message.created_at,
        read_at: message.read_at,
        edited_at: message.edited_at,
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
