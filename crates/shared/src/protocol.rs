use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::{ConversationId, ConversationKind, MessageId, MessageStatus, UserId},
    error::ApiError,
};

/// Inbound command envelope: every operation a client can issue, as one
/// tagged `{type, payload}` shape dispatched through a single handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientCommand {
    JoinConversation {
        conversation_id: ConversationId,
    },
    CreateConversation {
        client_ref: Uuid,
        participants: Vec<UserId>,
        kind: ConversationKind,
        topic: String,
        owner: UserId,
    },
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    StopTyping {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    SendMessage {
        client_ref: Uuid,
        conversation_id: ConversationId,
        user_id: UserId,
        message: String,
    },
    SendSecureMessage {
        client_ref: Uuid,
        conversation_id: ConversationId,
        user_id: UserId,
        message: String,
        encryption_algorithm: String,
        signature: String,
    },
    SendVoiceMessage {
        client_ref: Uuid,
        conversation_id: ConversationId,
        user_id: UserId,
        media_url: String,
    },
    SendSticker {
        client_ref: Uuid,
        conversation_id: ConversationId,
        user_id: UserId,
        media_url: String,
    },
    ReportMessage {
        client_ref: Uuid,
        conversation_id: ConversationId,
        message_id: MessageId,
        reporter_id: UserId,
        reason: String,
    },
    EditMessage {
        conversation_id: ConversationId,
        message_id: MessageId,
        new_message: String,
    },
    DeleteMessage {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    UnsendMessage {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    ForwardMessage {
        client_ref: Uuid,
        from_conversation_id: ConversationId,
        to_conversation_id: ConversationId,
        message_id: MessageId,
    },
    MessageRead {
        conversation_id: ConversationId,
        message_id: MessageId,
        reader_id: UserId,
    },
    PinMessage {
        conversation_id: ConversationId,
        message_id: MessageId,
        pin: bool,
        actor_id: UserId,
    },
    ReactionMessage {
        client_ref: Uuid,
        conversation_id: ConversationId,
        message_id: MessageId,
        emoji: String,
        reactor_id: UserId,
    },
    ScheduleMessage {
        client_ref: Uuid,
        conversation_id: ConversationId,
        user_id: UserId,
        message: String,
        scheduled_time: DateTime<Utc>,
    },
    SendEphemeralMessage {
        client_ref: Uuid,
        conversation_id: ConversationId,
        user_id: UserId,
        message: String,
        expires_in_seconds: u64,
    },
    CreatePoll {
        client_ref: Uuid,
        conversation_id: ConversationId,
        user_id: UserId,
        question: String,
        options: Vec<String>,
    },
    VotePoll {
        client_ref: Uuid,
        conversation_id: ConversationId,
        message_id: MessageId,
        option_index: u32,
        voter_id: UserId,
    },
}

impl ClientCommand {
    /// Conversation the command targets; the dispatcher uses this to pick
    /// the room whose write lock serializes the operation and whose members
    /// receive the broadcast.
    pub fn conversation_id(&self) -> ConversationId {
        match self {
            ClientCommand::JoinConversation { conversation_id }
            | ClientCommand::Typing {
                conversation_id, ..
            }
            | ClientCommand::StopTyping {
                conversation_id, ..
            }
            | ClientCommand::SendMessage {
                conversation_id, ..
            }
            | ClientCommand::SendSecureMessage {
                conversation_id, ..
            }
            | ClientCommand::SendVoiceMessage {
                conversation_id, ..
            }
            | ClientCommand::SendSticker {
                conversation_id, ..
            }
            | ClientCommand::ReportMessage {
                conversation_id, ..
            }
            | ClientCommand::EditMessage {
                conversation_id, ..
            }
            | ClientCommand::DeleteMessage {
                conversation_id, ..
            }
            | ClientCommand::UnsendMessage {
                conversation_id, ..
            }
            | ClientCommand::MessageRead {
                conversation_id, ..
            }
            | ClientCommand::PinMessage {
                conversation_id, ..
            }
            | ClientCommand::ReactionMessage {
                conversation_id, ..
            }
            | ClientCommand::ScheduleMessage {
                conversation_id, ..
            }
            | ClientCommand::SendEphemeralMessage {
                conversation_id, ..
            }
            | ClientCommand::CreatePoll {
                conversation_id, ..
            }
            | ClientCommand::VotePoll {
                conversation_id, ..
            } => *conversation_id,
            ClientCommand::CreateConversation { .. } => ConversationId(0),
            ClientCommand::ForwardMessage {
                to_conversation_id, ..
            } => *to_conversation_id,
        }
    }

    /// Client-generated idempotency key, present on every command whose
    /// server-side effect would not survive a blind replay: message creation
    /// plus votes, reactions, reports, and conversation creation.
    pub fn client_ref(&self) -> Option<Uuid> {
        match self {
            ClientCommand::SendMessage { client_ref, .. }
            | ClientCommand::SendSecureMessage { client_ref, .. }
            | ClientCommand::SendVoiceMessage { client_ref, .. }
            | ClientCommand::SendSticker { client_ref, .. }
            | ClientCommand::ForwardMessage { client_ref, .. }
            | ClientCommand::ScheduleMessage { client_ref, .. }
            | ClientCommand::SendEphemeralMessage { client_ref, .. }
            | ClientCommand::CreatePoll { client_ref, .. }
            | ClientCommand::CreateConversation { client_ref, .. }
            | ClientCommand::ReportMessage { client_ref, .. }
            | ClientCommand::ReactionMessage { client_ref, .. }
            | ClientCommand::VotePoll { client_ref, .. } => Some(*client_ref),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    pub topic: String,
    pub participants: Vec<UserId>,
    pub owner: UserId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub admins: Vec<UserId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PollState {
    pub question: String,
    pub options: Vec<String>,
    pub votes: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub message_id: MessageId,
    pub client_ref: Uuid,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    /// Opaque payload: plaintext or ciphertext, never interpreted here.
    pub content: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_algorithm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_from: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_by: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_at: Option<DateTime<Utc>>,
    /// Reactor lists accumulate in arrival order; a repeat reaction from the
    /// same user is recorded again rather than de-duplicated.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reactions: BTreeMap<String, Vec<UserId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll: Option<PollState>,
}

impl MessageRecord {
    pub fn is_tombstone(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Server-originated broadcasts, fanned out to every session in the target
/// conversation's room (the origin included, so optimistic client state is
/// reconciled against the authoritative echo).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    ConversationCreated {
        conversation: ConversationRecord,
    },
    Message {
        message: MessageRecord,
    },
    MessageEdited {
        message: MessageRecord,
    },
    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    MessageUnsent {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    MessageForwarded {
        message: MessageRecord,
    },
    MessageStatusUpdate {
        conversation_id: ConversationId,
        message_id: MessageId,
        status: MessageStatus,
        user_id: UserId,
    },
    MessagePinned {
        message: MessageRecord,
    },
    MessageReaction {
        conversation_id: ConversationId,
        message_id: MessageId,
        emoji: String,
        reactions: BTreeMap<String, Vec<UserId>>,
    },
    MessageReported {
        conversation_id: ConversationId,
        message_id: MessageId,
        reporter_id: UserId,
    },
    PollVoted {
        conversation_id: ConversationId,
        message_id: MessageId,
        option_index: u32,
        votes: Vec<i64>,
    },
    Typing {
        conversation_id: ConversationId,
        user: UserId,
    },
    StopTyping {
        conversation_id: ConversationId,
        user: UserId,
    },
    Error(ApiError),
}

impl ServerEvent {
    /// Room the event is published to, when it is room-scoped.
    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            ServerEvent::ConversationCreated { conversation } => {
                Some(conversation.conversation_id)
            }
            ServerEvent::Message { message }
            | ServerEvent::MessageEdited { message }
            | ServerEvent::MessageForwarded { message }
            | ServerEvent::MessagePinned { message } => Some(message.conversation_id),
            ServerEvent::MessageDeleted {
                conversation_id, ..
            }
            | ServerEvent::MessageUnsent {
                conversation_id, ..
            }
            | ServerEvent::MessageStatusUpdate {
                conversation_id, ..
            }
            | ServerEvent::MessageReaction {
                conversation_id, ..
            }
            | ServerEvent::MessageReported {
                conversation_id, ..
            }
            | ServerEvent::PollVoted {
                conversation_id, ..
            }
            | ServerEvent::Typing {
                conversation_id, ..
            }
            | ServerEvent::StopTyping {
                conversation_id, ..
            } => Some(*conversation_id),
            ServerEvent::Error(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_envelope_uses_wire_event_names() {
        let cmd = ClientCommand::JoinConversation {
            conversation_id: ConversationId(7),
        };
        let json = serde_json::to_value(&cmd).expect("serialize");
        assert_eq!(json["type"], "joinConversation");
        assert_eq!(json["payload"]["conversationId"], 7);
    }

    #[test]
    fn vote_event_round_trips() {
        let event = ServerEvent::PollVoted {
            conversation_id: ConversationId(1),
            message_id: MessageId(2),
            option_index: 1,
            votes: vec![0, 1],
        };
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("\"pollVoted\""));
        let back: ServerEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.conversation_id(), Some(ConversationId(1)));
    }
}
