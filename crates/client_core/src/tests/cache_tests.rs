use super::*;
use std::collections::BTreeMap;

use shared::protocol::PollState;

fn server_message(
    client_ref: Uuid,
    message_id: i64,
    conversation_id: i64,
    sender_id: i64,
    content: &str,
) -> MessageRecord {
    MessageRecord {
        message_id: MessageId(message_id),
        client_ref,
        conversation_id: ConversationId(conversation_id),
        sender_id: UserId(sender_id),
        content: content.to_string(),
        status: MessageStatus::Sent,
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
        reactions: BTreeMap::new(),
        poll: None,
    }
}

#[test]
fn server_echo_replaces_the_provisional_record() {
    let store = LocalStore::new();
    let client_ref = Uuid::new_v4();
    let provisional =
        store.insert_provisional(client_ref, ConversationId(1), UserId(7), "hello");
    assert!(provisional.message_id.0 < 0);
    assert_eq!(provisional.status, MessageStatus::Pending);

    store.apply_event(&ServerEvent::Message {
        message: server_message(client_ref, 42, 1, 7, "hello"),
    });

    let messages = store.messages(ConversationId(1));
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_id, MessageId(42));
    assert_eq!(messages[0].status, MessageStatus::Sent);
}

#[test]
fn duplicate_echo_does_not_create_a_second_record() {
    let store = LocalStore::new();
    let message = server_message(Uuid::new_v4(), 42, 1, 7, "hello");
    store.apply_event(&ServerEvent::Message {
        message: message.clone(),
    });
    store.apply_event(&ServerEvent::Message { message });
    assert_eq!(store.messages(ConversationId(1)).len(), 1);
}

#[test]
fn status_updates_are_monotonic() {
    let store = LocalStore::new();
    let message = server_message(Uuid::new_v4(), 1, 1, 7, "hi");
    store.apply_event(&ServerEvent::Message { message });

    let update = |status| ServerEvent::MessageStatusUpdate {
        conversation_id: ConversationId(1),
        message_id: MessageId(1),
        status,
        user_id: UserId(9),
    };

    store.apply_event(&update(MessageStatus::Read));
    // A straggling `delivered` must not undo `read`.
    store.apply_event(&update(MessageStatus::Delivered));
    assert_eq!(store.messages(ConversationId(1))[0].status, MessageStatus::Read);
}

#[test]
fn delete_event_tombstones_in_place() {
    let store = LocalStore::new();
    let message = server_message(Uuid::new_v4(), 5, 2, 7, "secret");
    store.apply_event(&ServerEvent::Message { message });

    store.apply_event(&ServerEvent::MessageDeleted {
        conversation_id: ConversationId(2),
        message_id: MessageId(5),
    });

    let messages = store.messages(ConversationId(2));
    assert_eq!(messages.len(), 1);
    assert!(messages[0].content.is_empty());
    assert!(messages[0].deleted_at.is_some());
}

#[test]
fn reaction_and_poll_events_update_the_cached_record() {
    let store = LocalStore::new();
    let mut message = server_message(Uuid::new_v4(), 3, 1, 7, "poll");
    message.poll = Some(PollState {
        question: "lunch?".into(),
        options: vec!["yes".into(), "no".into()],
        votes: vec![0, 0],
    });
    store.apply_event(&ServerEvent::Message { message });

    let mut reactions = BTreeMap::new();
    reactions.insert("👍".to_string(), vec![UserId(7), UserId(7)]);
    store.apply_event(&ServerEvent::MessageReaction {
        conversation_id: ConversationId(1),
        message_id: MessageId(3),
        emoji: "👍".into(),
        reactions: reactions.clone(),
    });
    store.apply_event(&ServerEvent::PollVoted {
        conversation_id: ConversationId(1),
        message_id: MessageId(3),
        option_index: 1,
        votes: vec![0, 1],
    });

    let cached = &store.messages(ConversationId(1))[0];
    assert_eq!(cached.reactions, reactions);
    assert_eq!(cached.poll.as_ref().expect("poll").votes, vec![0, 1]);
}

#[test]
fn events_for_unknown_messages_are_ignored() {
    let store = LocalStore::new();
    store.apply_event(&ServerEvent::MessageDeleted {
        conversation_id: ConversationId(9),
        message_id: MessageId(9),
    });
    assert!(store.messages(ConversationId(9)).is_empty());
}

#[test]
fn provisional_records_sort_after_confirmed_ones() {
    let store = LocalStore::new();
    store.insert_provisional(Uuid::new_v4(), ConversationId(1), UserId(7), "queued");
    store.apply_event(&ServerEvent::Message {
        message: server_message(Uuid::new_v4(), 10, 1, 8, "confirmed"),
    });

    let messages = store.messages(ConversationId(1));
    assert_eq!(messages[0].content, "confirmed");
    assert_eq!(messages[1].content, "queued");
}

#[test]
fn mark_failed_flags_the_provisional_record() {
    let store = LocalStore::new();
    let client_ref = Uuid::new_v4();
    store.insert_provisional(client_ref, ConversationId(1), UserId(7), "doomed");
    store.mark_failed(client_ref);
    assert_eq!(
        store.messages(ConversationId(1))[0].status,
        MessageStatus::Failed
    );
}
