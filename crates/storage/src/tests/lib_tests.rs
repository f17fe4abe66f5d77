use super::*;

async fn setup() -> (Storage, ConversationRecord) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let conversation = storage
        .create_conversation(
            ConversationKind::Group,
            "general",
            UserId(1),
            &[UserId(1), UserId(2), UserId(3)],
        )
        .await
        .expect("conversation");
    (storage, conversation)
}

#[tokio::test]
async fn group_owner_is_seeded_as_sole_admin() {
    let (storage, conversation) = setup().await;
    let loaded = storage
        .load_conversation(conversation.conversation_id)
        .await
        .expect("load")
        .expect("exists");
    assert_eq!(loaded.admins, vec![UserId(1)]);
    assert_eq!(loaded.participants, vec![UserId(1), UserId(2), UserId(3)]);
    assert_eq!(loaded.kind, ConversationKind::Group);
}

#[tokio::test]
async fn replayed_client_ref_does_not_insert_twice() {
    let (storage, conversation) = setup().await;
    let client_ref = Uuid::new_v4();
    let new = NewMessage::text(client_ref, conversation.conversation_id, UserId(2), "hello");

    let (first, inserted) = storage.insert_message(new.clone()).await.expect("insert");
    assert!(inserted);
    let (second, inserted_again) = storage.insert_message(new).await.expect("replay");
    assert!(!inserted_again);
    assert_eq!(first.message_id, second.message_id);

    let messages = storage
        .list_messages(conversation.conversation_id, 10, None)
        .await
        .expect("list");
    assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn tombstone_clears_content_but_keeps_the_row() {
    let (storage, conversation) = setup().await;
    let (message, _) = storage
        .insert_message(NewMessage::text(
            Uuid::new_v4(),
            conversation.conversation_id,
            UserId(2),
            "delete me",
        ))
        .await
        .expect("insert");

    storage
        .tombstone_message(message.message_id)
        .await
        .expect("tombstone");
    let loaded = storage
        .load_message(message.message_id)
        .await
        .expect("load")
        .expect("row retained");
    assert!(loaded.is_tombstone());
    assert!(loaded.content.is_empty());
    assert_eq!(loaded.message_id, message.message_id);
}

#[tokio::test]
async fn status_updates_never_regress() {
    let (storage, conversation) = setup().await;
    let (message, _) = storage
        .insert_message(NewMessage::text(
            Uuid::new_v4(),
            conversation.conversation_id,
            UserId(2),
            "hi",
        ))
        .await
        .expect("insert");

    let status = storage
        .advance_status(message.message_id, MessageStatus::Read)
        .await
        .expect("advance");
    assert_eq!(status, MessageStatus::Read);

    // A later delivery receipt must not pull the status back.
    let status = storage
        .advance_status(message.message_id, MessageStatus::Delivered)
        .await
        .expect("advance");
    assert_eq!(status, MessageStatus::Read);
}

#[tokio::test]
async fn reactions_accumulate_without_per_user_dedup() {
    let (storage, conversation) = setup().await;
    let (message, _) = storage
        .insert_message(NewMessage::text(
            Uuid::new_v4(),
            conversation.conversation_id,
            UserId(2),
            "react to me",
        ))
        .await
        .expect("insert");

    storage
        .add_reaction(message.message_id, "👍", UserId(3))
        .await
        .expect("react");
    let reactions = storage
        .add_reaction(message.message_id, "👍", UserId(3))
        .await
        .expect("react again");
    assert_eq!(reactions["👍"], vec![UserId(3), UserId(3)]);
}

#[tokio::test]
async fn mark_read_is_idempotent() {
    let (storage, conversation) = setup().await;
    let (message, _) = storage
        .insert_message(NewMessage::text(
            Uuid::new_v4(),
            conversation.conversation_id,
            UserId(2),
            "read me",
        ))
        .await
        .expect("insert");

    storage.mark_read(message.message_id, UserId(3)).await.expect("read");
    storage.mark_read(message.message_id, UserId(3)).await.expect("read again");
}

#[tokio::test]
async fn poll_votes_count_exactly_and_reject_out_of_range() {
    let (storage, conversation) = setup().await;
    let mut new = NewMessage::text(
        Uuid::new_v4(),
        conversation.conversation_id,
        UserId(1),
        "poll",
    );
    new.poll = Some(("lunch?".to_string(), vec!["pizza".into(), "sushi".into()]));
    let (message, _) = storage.insert_message(new).await.expect("insert");
    assert_eq!(message.poll.as_ref().expect("poll").votes, vec![0, 0]);

    storage
        .vote_poll(message.message_id, 1, UserId(2))
        .await
        .expect("vote");
    let votes = storage
        .vote_poll(message.message_id, 1, UserId(3))
        .await
        .expect("vote")
        .expect("in range");
    assert_eq!(votes, vec![0, 2]);
    assert_eq!(
        storage.poll_voters(message.message_id).await.expect("voters"),
        vec![(1, UserId(2)), (1, UserId(3))]
    );

    let out_of_range = storage
        .vote_poll(message.message_id, 5, UserId(2))
        .await
        .expect("vote");
    assert!(out_of_range.is_none());
    let poll = storage
        .load_message(message.message_id)
        .await
        .expect("load")
        .expect("exists")
        .poll
        .expect("poll");
    assert_eq!(poll.votes, vec![0, 2]);
}

#[tokio::test]
async fn list_messages_pages_backwards_from_before() {
    let (storage, conversation) = setup().await;
    let mut ids = Vec::new();
    for n in 0..5 {
        let (message, _) = storage
            .insert_message(NewMessage::text(
                Uuid::new_v4(),
                conversation.conversation_id,
                UserId(2),
                format!("m{n}"),
            ))
            .await
            .expect("insert");
        ids.push(message.message_id);
    }

    let page = storage
        .list_messages(conversation.conversation_id, 2, Some(ids[3]))
        .await
        .expect("list");
    let got: Vec<MessageId> = page.iter().map(|m| m.message_id).collect();
    assert_eq!(got, vec![ids[1], ids[2]]);
}
