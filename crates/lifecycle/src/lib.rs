//! The single authority for validating and applying message operations.
//!
//! Every operation takes the shared [`ApiContext`], validates identifier
//! format and existence before touching persistence, and returns the wire
//! event the caller broadcasts to the conversation's room.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use shared::{
    domain::{ConversationId, ConversationKind, MessageId, MessageStatus, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ConversationRecord, MessageRecord, ServerEvent},
};
use storage::{NewMessage, Storage};

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

/// A send whose emission is deferred to `fire_at`. The caller arms a
/// cancelable timer keyed on `client_ref` and calls [`fire_scheduled`] when
/// it elapses.
#[derive(Debug, Clone)]
pub struct ScheduledSend {
    pub client_ref: Uuid,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub fire_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum ScheduleOutcome {
    /// `scheduled_at` was already due; the message went out immediately.
    Sent(ServerEvent),
    Deferred(ScheduledSend),
}

pub async fn create_conversation(
    ctx: &ApiContext,
    client_ref: Uuid,
    participants: &[UserId],
    kind: ConversationKind,
    topic: &str,
    owner: UserId,
) -> Result<ServerEvent, ApiError> {
    if let Some(event) = find_applied(ctx, client_ref).await? {
        return Ok(event);
    }
    if participants.is_empty() {
        return Err(ApiError::validation("participants must not be empty"));
    }
    let conversation = ctx
        .storage
        .create_conversation(kind, topic, owner, participants)
        .await
        .map_err(internal)?;
    let event = ServerEvent::ConversationCreated { conversation };
    record_applied(ctx, client_ref, &event).await?;
    Ok(event)
}

pub async fn send_message(
    ctx: &ApiContext,
    client_ref: Uuid,
    conversation_id: ConversationId,
    sender_id: UserId,
    content: &str,
) -> Result<ServerEvent, ApiError> {
    ensure_conversation(ctx, conversation_id).await?;
    let message = persist_send(
        ctx,
        NewMessage::text(client_ref, conversation_id, sender_id, content),
    )
    .await?;
    Ok(ServerEvent::Message { message })
}

/// Send with an opaque encryption tag and signature. The ciphertext is
/// validated only for shape; it is never interpreted.
pub async fn send_secure_message(
    ctx: &ApiContext,
    client_ref: Uuid,
    conversation_id: ConversationId,
    sender_id: UserId,
    ciphertext: &str,
    encryption_algorithm: &str,
    signature: &str,
) -> Result<ServerEvent, ApiError> {
    ensure_conversation(ctx, conversation_id).await?;
    if ciphertext.is_empty() || STANDARD.decode(ciphertext).is_err() {
        return Err(ApiError::validation("ciphertext must be non-empty base64"));
    }
    if encryption_algorithm.is_empty() || signature.is_empty() {
        return Err(ApiError::validation(
            "encryption algorithm and signature are required",
        ));
    }
    let mut new = NewMessage::text(client_ref, conversation_id, sender_id, ciphertext);
    new.encryption_algorithm = Some(encryption_algorithm.to_string());
    new.signature = Some(signature.to_string());
    let message = persist_send(ctx, new).await?;
    Ok(ServerEvent::Message { message })
}

/// Voice messages and stickers: the media url rides the opaque content slot.
pub async fn send_media_message(
    ctx: &ApiContext,
    client_ref: Uuid,
    conversation_id: ConversationId,
    sender_id: UserId,
    media_url: &str,
) -> Result<ServerEvent, ApiError> {
    ensure_conversation(ctx, conversation_id).await?;
    if media_url.trim().is_empty() {
        return Err(ApiError::validation("media url must not be empty"));
    }
    let message = persist_send(
        ctx,
        NewMessage::text(client_ref, conversation_id, sender_id, media_url),
    )
    .await?;
    Ok(ServerEvent::Message { message })
}

pub async fn edit_message(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    message_id: MessageId,
    new_content: &str,
) -> Result<ServerEvent, ApiError> {
    let message = require_message(ctx, conversation_id, message_id).await?;
    if message.is_tombstone() {
        return Err(ApiError::validation("cannot edit a deleted message"));
    }
    ctx.storage
        .edit_message(message_id, new_content)
        .await
        .map_err(internal)?;
    let message = require_message(ctx, conversation_id, message_id).await?;
    Ok(ServerEvent::MessageEdited { message })
}

pub async fn delete_message(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    message_id: MessageId,
    unsend: bool,
) -> Result<ServerEvent, ApiError> {
    require_message(ctx, conversation_id, message_id).await?;
    ctx.storage
        .tombstone_message(message_id)
        .await
        .map_err(internal)?;
    Ok(if unsend {
        ServerEvent::MessageUnsent {
            conversation_id,
            message_id,
        }
    } else {
        ServerEvent::MessageDeleted {
            conversation_id,
            message_id,
        }
    })
}

/// Copies the source content into a new record in the target conversation
/// with a back-reference to the source conversation. The source message is
/// never mutated; the event belongs to the target room only.
pub async fn forward_message(
    ctx: &ApiContext,
    client_ref: Uuid,
    from_conversation_id: ConversationId,
    to_conversation_id: ConversationId,
    message_id: MessageId,
) -> Result<ServerEvent, ApiError> {
    let source = require_message(ctx, from_conversation_id, message_id).await?;
    ensure_conversation(ctx, to_conversation_id).await?;
    let mut new = NewMessage::text(
        client_ref,
        to_conversation_id,
        source.sender_id,
        &source.content,
    );
    new.forwarded_from = Some(from_conversation_id);
    let message = persist_send(ctx, new).await?;
    Ok(ServerEvent::MessageForwarded { message })
}

pub async fn mark_read(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    message_id: MessageId,
    reader_id: UserId,
) -> Result<ServerEvent, ApiError> {
    let message = require_message(ctx, conversation_id, message_id).await?;
    if message.is_tombstone() {
        return Err(ApiError::validation("cannot mark a deleted message read"));
    }
    ctx.storage
        .mark_read(message_id, reader_id)
        .await
        .map_err(internal)?;
    let status = ctx
        .storage
        .advance_status(message_id, MessageStatus::Read)
        .await
        .map_err(internal)?;
    Ok(ServerEvent::MessageStatusUpdate {
        conversation_id,
        message_id,
        status,
        user_id: reader_id,
    })
}

pub async fn pin_message(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    message_id: MessageId,
    pin: bool,
    actor_id: UserId,
) -> Result<ServerEvent, ApiError> {
    let message = require_message(ctx, conversation_id, message_id).await?;
    if message.is_tombstone() {
        return Err(ApiError::validation("cannot pin a deleted message"));
    }
    ctx.storage
        .set_pinned(message_id, pin, actor_id)
        .await
        .map_err(internal)?;
    let message = require_message(ctx, conversation_id, message_id).await?;
    Ok(ServerEvent::MessagePinned { message })
}

pub async fn react(
    ctx: &ApiContext,
    client_ref: Uuid,
    conversation_id: ConversationId,
    message_id: MessageId,
    emoji: &str,
    reactor_id: UserId,
) -> Result<ServerEvent, ApiError> {
    if let Some(event) = find_applied(ctx, client_ref).await? {
        return Ok(event);
    }
    if emoji.is_empty() {
        return Err(ApiError::validation("emoji must not be empty"));
    }
    let message = require_message(ctx, conversation_id, message_id).await?;
    if message.is_tombstone() {
        return Err(ApiError::validation("cannot react to a deleted message"));
    }
    let reactions = ctx
        .storage
        .add_reaction(message_id, emoji, reactor_id)
        .await
        .map_err(internal)?;
    let event = ServerEvent::MessageReaction {
        conversation_id,
        message_id,
        emoji: emoji.to_string(),
        reactions,
    };
    record_applied(ctx, client_ref, &event).await?;
    Ok(event)
}

/// Validates the target conversation and decides whether the send is
/// already due. Deferred sends are persisted only when the timer fires, so
/// a restart before then drops them (kept as-is, see the design notes).
pub async fn schedule_message(
    ctx: &ApiContext,
    client_ref: Uuid,
    conversation_id: ConversationId,
    sender_id: UserId,
    content: &str,
    scheduled_time: DateTime<Utc>,
) -> Result<ScheduleOutcome, ApiError> {
    ensure_conversation(ctx, conversation_id).await?;
    if scheduled_time <= Utc::now() {
        let event = send_message(ctx, client_ref, conversation_id, sender_id, content).await?;
        return Ok(ScheduleOutcome::Sent(event));
    }
    Ok(ScheduleOutcome::Deferred(ScheduledSend {
        client_ref,
        conversation_id,
        sender_id,
        content: content.to_string(),
        fire_at: scheduled_time,
    }))
}

pub async fn fire_scheduled(
    ctx: &ApiContext,
    scheduled: &ScheduledSend,
) -> Result<ServerEvent, ApiError> {
    ensure_conversation(ctx, scheduled.conversation_id).await?;
    let mut new = NewMessage::text(
        scheduled.client_ref,
        scheduled.conversation_id,
        scheduled.sender_id,
        &scheduled.content,
    );
    new.scheduled_at = Some(scheduled.fire_at);
    let message = persist_send(ctx, new).await?;
    Ok(ServerEvent::Message { message })
}

pub async fn send_ephemeral_message(
    ctx: &ApiContext,
    client_ref: Uuid,
    conversation_id: ConversationId,
    sender_id: UserId,
    content: &str,
    expires_in_seconds: u64,
) -> Result<ServerEvent, ApiError> {
    ensure_conversation(ctx, conversation_id).await?;
    if expires_in_seconds == 0 {
        return Err(ApiError::validation("ephemeral ttl must be positive"));
    }
    let mut new = NewMessage::text(client_ref, conversation_id, sender_id, content);
    new.ephemeral_expires_at = Some(Utc::now() + Duration::seconds(expires_in_seconds as i64));
    let message = persist_send(ctx, new).await?;
    Ok(ServerEvent::Message { message })
}

/// Expiry timer body for an ephemeral message: tombstone and announce the
/// deletion, unless something already deleted it.
pub async fn expire_ephemeral(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    message_id: MessageId,
) -> Result<Option<ServerEvent>, ApiError> {
    let Some(message) = ctx.storage.load_message(message_id).await.map_err(internal)? else {
        return Ok(None);
    };
    if message.is_tombstone() || message.conversation_id != conversation_id {
        return Ok(None);
    }
    ctx.storage
        .tombstone_message(message_id)
        .await
        .map_err(internal)?;
    Ok(Some(ServerEvent::MessageDeleted {
        conversation_id,
        message_id,
    }))
}

pub async fn create_poll(
    ctx: &ApiContext,
    client_ref: Uuid,
    conversation_id: ConversationId,
    sender_id: UserId,
    question: &str,
    options: &[String],
) -> Result<ServerEvent, ApiError> {
    ensure_conversation(ctx, conversation_id).await?;
    if options.is_empty() {
        return Err(ApiError::validation("a poll needs at least one option"));
    }
    let mut new = NewMessage::text(client_ref, conversation_id, sender_id, question);
    new.poll = Some((question.to_string(), options.to_vec()));
    let message = persist_send(ctx, new).await?;
    Ok(ServerEvent::Message { message })
}

pub async fn vote_poll(
    ctx: &ApiContext,
    client_ref: Uuid,
    conversation_id: ConversationId,
    message_id: MessageId,
    option_index: u32,
    voter_id: UserId,
) -> Result<ServerEvent, ApiError> {
    if let Some(event) = find_applied(ctx, client_ref).await? {
        return Ok(event);
    }
    require_message(ctx, conversation_id, message_id).await?;
    if !ctx.storage.has_poll(message_id).await.map_err(internal)? {
        return Err(ApiError::not_found("message carries no poll"));
    }
    let votes = ctx
        .storage
        .vote_poll(message_id, option_index, voter_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::validation("poll option index out of range"))?;
    let event = ServerEvent::PollVoted {
        conversation_id,
        message_id,
        option_index,
        votes,
    };
    record_applied(ctx, client_ref, &event).await?;
    Ok(event)
}

/// Records a report entity; the reported message itself is never mutated.
pub async fn report_message(
    ctx: &ApiContext,
    client_ref: Uuid,
    conversation_id: ConversationId,
    message_id: MessageId,
    reporter_id: UserId,
    reason: &str,
) -> Result<ServerEvent, ApiError> {
    if let Some(event) = find_applied(ctx, client_ref).await? {
        return Ok(event);
    }
    require_message(ctx, conversation_id, message_id).await?;
    ctx.storage
        .insert_report(conversation_id, message_id, reporter_id, reason)
        .await
        .map_err(internal)?;
    let event = ServerEvent::MessageReported {
        conversation_id,
        message_id,
        reporter_id,
    };
    record_applied(ctx, client_ref, &event).await?;
    Ok(event)
}

/// Transient, never persisted.
pub fn typing(conversation_id: ConversationId, user: UserId, stopped: bool) -> ServerEvent {
    if stopped {
        ServerEvent::StopTyping {
            conversation_id,
            user,
        }
    } else {
        ServerEvent::Typing {
            conversation_id,
            user,
        }
    }
}

pub async fn list_conversations(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<ConversationRecord>, ApiError> {
    ctx.storage
        .list_conversations_for_user(user_id)
        .await
        .map_err(internal)
}

pub async fn list_messages(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    limit: u32,
    before: Option<MessageId>,
) -> Result<Vec<MessageRecord>, ApiError> {
    ensure_conversation(ctx, conversation_id).await?;
    ctx.storage
        .list_messages(conversation_id, limit, before)
        .await
        .map_err(internal)
}

async fn persist_send(ctx: &ApiContext, new: NewMessage) -> Result<MessageRecord, ApiError> {
    let (message, inserted) = ctx.storage.insert_message(new).await.map_err(internal)?;
    if !inserted {
        tracing::debug!(
            client_ref = %message.client_ref,
            message_id = message.message_id.0,
            "replayed send matched an existing message"
        );
    }
    Ok(message)
}

/// Identifier-format and existence guard shared by every conversation-
/// scoped operation (typing included).
pub async fn ensure_conversation(
    ctx: &ApiContext,
    conversation_id: ConversationId,
) -> Result<(), ApiError> {
    if !conversation_id.is_well_formed() {
        return Err(ApiError::validation("malformed conversation id"));
    }
    if !ctx
        .storage
        .conversation_exists(conversation_id)
        .await
        .map_err(internal)?
    {
        return Err(ApiError::not_found(format!(
            "conversation {} not found",
            conversation_id.0
        )));
    }
    Ok(())
}

/// Loads a message and pins it to the conversation named by the command, so
/// a mismatched pair can never mutate or broadcast across rooms.
async fn require_message(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    message_id: MessageId,
) -> Result<MessageRecord, ApiError> {
    if !message_id.is_well_formed() {
        return Err(ApiError::validation("malformed message id"));
    }
    let message = ctx
        .storage
        .load_message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(format!("message {} not found", message_id.0)))?;
    if message.conversation_id != conversation_id {
        return Err(ApiError::not_found(format!(
            "message {} not found in conversation {}",
            message_id.0, conversation_id.0
        )));
    }
    Ok(message)
}

/// Replay lookup for operations without a message row of their own: the
/// first application records its event under the client reference, and a
/// resubmission gets that event back instead of a second effect.
async fn find_applied(
    ctx: &ApiContext,
    client_ref: Uuid,
) -> Result<Option<ServerEvent>, ApiError> {
    ctx.storage.find_applied_op(client_ref).await.map_err(internal)
}

async fn record_applied(
    ctx: &ApiContext,
    client_ref: Uuid,
    event: &ServerEvent,
) -> Result<(), ApiError> {
    ctx.storage
        .record_applied_op(client_ref, event)
        .await
        .map_err(internal)
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
