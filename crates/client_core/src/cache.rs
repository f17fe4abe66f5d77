use std::{
    collections::HashMap,
    sync::Mutex as StdMutex,
};

use chrono::Utc;
use uuid::Uuid;

use shared::{
    domain::{ConversationId, MessageId, MessageStatus, UserId},
    protocol::{ConversationRecord, MessageRecord, ServerEvent},
};

/// Local view of conversations and messages. Outbound sends land here
/// immediately as provisional records (negative ids, `pending` status) and
/// are reconciled in place when the authoritative server echo arrives,
/// matched by client reference.
#[derive(Default)]
pub struct LocalStore {
    inner: StdMutex<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    conversations: HashMap<ConversationId, ConversationRecord>,
    messages: HashMap<ConversationId, Vec<MessageRecord>>,
    next_provisional: i64,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_conversation(&self, conversation: ConversationRecord) {
        let mut inner = self.inner.lock().expect("store lock");
        inner
            .conversations
            .insert(conversation.conversation_id, conversation);
    }

    pub fn conversations(&self) -> Vec<ConversationRecord> {
        let inner = self.inner.lock().expect("store lock");
        let mut list: Vec<_> = inner.conversations.values().cloned().collect();
        list.sort_by_key(|c| c.conversation_id.0);
        list
    }

    pub fn messages(&self, conversation_id: ConversationId) -> Vec<MessageRecord> {
        let inner = self.inner.lock().expect("store lock");
        inner
            .messages
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Optimistic insert for an outbound send. Provisional ids count down
    /// from -1 so they can never collide with a server-assigned id.
    pub fn insert_provisional(
        &self,
        client_ref: Uuid,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
    ) -> MessageRecord {
        let mut inner = self.inner.lock().expect("store lock");
        inner.next_provisional -= 1;
        let record = MessageRecord {
            message_id: MessageId(inner.next_provisional),
            client_ref,
            conversation_id,
            sender_id,
            content: content.to_string(),
            status: MessageStatus::Pending,
            created_at: Utc::now(),
            encryption_algorithm: None,
            signature: None,
            edited_at: None,
            deleted_at: None,
            forwarded_from: None,
            scheduled_at: None,
            ephemeral_expires_at: None,
            pinned: false,
            pinned_by: None,
            pinned_at: None,
            reactions: Default::default(),
            poll: None,
        };
        inner
            .messages
            .entry(conversation_id)
            .or_default()
            .push(record.clone());
        record
    }

    /// Drops a provisional record whose command was canceled before replay.
    pub fn remove_provisional(&self, client_ref: Uuid) -> bool {
        let mut inner = self.inner.lock().expect("store lock");
        for messages in inner.messages.values_mut() {
            if let Some(index) = messages
                .iter()
                .position(|m| m.client_ref == client_ref && m.message_id.0 < 0)
            {
                messages.remove(index);
                return true;
            }
        }
        false
    }

    /// Marks the provisional record for a dead-lettered command as failed so
    /// the user can see it never reached the server.
    pub fn mark_failed(&self, client_ref: Uuid) {
        let mut inner = self.inner.lock().expect("store lock");
        for messages in inner.messages.values_mut() {
            for message in messages.iter_mut() {
                if message.client_ref == client_ref {
                    message.status = MessageStatus::Failed;
                    return;
                }
            }
        }
    }

    /// Reconciles one server event into the local view. Events for unknown
    /// messages are ignored rather than treated as errors; a later history
    /// fetch will fill the gap.
    pub fn apply_event(&self, event: &ServerEvent) {
        let mut inner = self.inner.lock().expect("store lock");
        match event {
            ServerEvent::ConversationCreated { conversation } => {
                inner
                    .conversations
                    .insert(conversation.conversation_id, conversation.clone());
            }
            ServerEvent::Message { message }
            | ServerEvent::MessageForwarded { message } => {
                inner.absorb_message(message);
            }
            ServerEvent::MessageEdited { message }
            | ServerEvent::MessagePinned { message } => {
                inner.replace_message(message);
            }
            ServerEvent::MessageDeleted {
                conversation_id,
                message_id,
            }
            | ServerEvent::MessageUnsent {
                conversation_id,
                message_id,
            } => {
                if let Some(message) = inner.find_mut(*conversation_id, *message_id) {
                    message.content.clear();
                    message.deleted_at = Some(Utc::now());
                }
            }
            ServerEvent::MessageStatusUpdate {
                conversation_id,
                message_id,
                status,
                ..
            } => {
                if let Some(message) = inner.find_mut(*conversation_id, *message_id) {
                    // Monotonic: a late `delivered` never undoes `read`.
                    if message.status.can_transition_to(*status) {
                        message.status = *status;
                    }
                }
            }
            ServerEvent::MessageReaction {
                conversation_id,
                message_id,
                reactions,
                ..
            } => {
                if let Some(message) = inner.find_mut(*conversation_id, *message_id) {
                    message.reactions = reactions.clone();
                }
            }
            ServerEvent::PollVoted {
                conversation_id,
                message_id,
                votes,
                ..
            } => {
                if let Some(message) = inner.find_mut(*conversation_id, *message_id) {
                    if let Some(poll) = message.poll.as_mut() {
                        poll.votes = votes.clone();
                    }
                }
            }
            ServerEvent::MessageReported { .. }
            | ServerEvent::Typing { .. }
            | ServerEvent::StopTyping { .. }
            | ServerEvent::Error(_) => {}
        }
    }
}

impl StoreInner {
    fn find_mut(
        &mut self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Option<&mut MessageRecord> {
        self.messages
            .get_mut(&conversation_id)?
            .iter_mut()
            .find(|m| m.message_id == message_id)
    }

    /// New authoritative message: replaces the matching provisional record
    /// if one exists, updates in place on a duplicate echo, appends
    /// otherwise.
    fn absorb_message(&mut self, message: &MessageRecord) {
        let messages = self.messages.entry(message.conversation_id).or_default();
        if let Some(existing) = messages
            .iter_mut()
            .find(|m| m.client_ref == message.client_ref || m.message_id == message.message_id)
        {
            *existing = message.clone();
        } else {
            messages.push(message.clone());
        }
        messages.sort_by_key(|m| {
            // Provisional records sort after every confirmed one.
            if m.message_id.0 < 0 {
                (1, 0, m.created_at)
            } else {
                (0, m.message_id.0, m.created_at)
            }
        });
    }

    fn replace_message(&mut self, message: &MessageRecord) {
        if let Some(existing) = self.find_mut(message.conversation_id, message.message_id) {
            *existing = message.clone();
        }
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
