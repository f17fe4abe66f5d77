use super::*;
use shared::domain::{MessageId, UserId};

fn typing_event(conversation: i64) -> ServerEvent {
    ServerEvent::Typing {
        conversation_id: ConversationId(conversation),
        user: UserId(1),
    }
}

#[tokio::test]
async fn broadcast_reaches_every_member_including_origin() {
    let rooms = Rooms::new(8);
    let (a, mut rx_a) = rooms.register_session().await;
    let (b, mut rx_b) = rooms.register_session().await;
    let (_c, mut rx_c) = rooms.register_session().await;

    rooms.join(ConversationId(1), a).await;
    rooms.join(ConversationId(1), b).await;
    // c never joins.

    rooms.broadcast(ConversationId(1), &typing_event(1)).await;

    assert!(rx_a.try_recv().is_ok());
    assert!(rx_b.try_recv().is_ok());
    assert!(rx_c.try_recv().is_err());
}

#[tokio::test]
async fn slow_consumer_loses_events_without_blocking_others() {
    let rooms = Rooms::new(1);
    let (slow, mut slow_rx) = rooms.register_session().await;
    let (fast, mut fast_rx) = rooms.register_session().await;
    rooms.join(ConversationId(1), slow).await;
    rooms.join(ConversationId(1), fast).await;

    rooms.broadcast(ConversationId(1), &typing_event(1)).await;
    // The slow consumer's buffer is now full; the second event is dropped
    // for it but still delivered to the fast one.
    rooms.broadcast(ConversationId(1), &typing_event(1)).await;

    assert!(slow_rx.try_recv().is_ok());
    assert!(slow_rx.try_recv().is_err());

    assert!(fast_rx.try_recv().is_ok());
    assert!(fast_rx.try_recv().is_ok());
}

#[tokio::test]
async fn unregister_removes_session_from_all_rooms() {
    let rooms = Rooms::new(8);
    let (a, _rx) = rooms.register_session().await;
    rooms.join(ConversationId(1), a).await;
    rooms.join(ConversationId(2), a).await;
    assert_eq!(rooms.member_count(ConversationId(1)).await, 1);

    rooms.unregister_session(a).await;
    assert_eq!(rooms.member_count(ConversationId(1)).await, 0);
    assert_eq!(rooms.member_count(ConversationId(2)).await, 0);
}

#[tokio::test]
async fn disconnected_receiver_is_pruned_on_broadcast() {
    let rooms = Rooms::new(8);
    let (a, rx) = rooms.register_session().await;
    rooms.join(ConversationId(1), a).await;
    drop(rx);

    rooms
        .broadcast(
            ConversationId(1),
            &ServerEvent::MessageDeleted {
                conversation_id: ConversationId(1),
                message_id: MessageId(1),
            },
        )
        .await;
    assert_eq!(rooms.member_count(ConversationId(1)).await, 0);
}

#[tokio::test]
async fn write_lock_is_shared_per_conversation() {
    let rooms = Rooms::new(8);
    let first = rooms.write_lock(ConversationId(1)).await;
    let second = rooms.write_lock(ConversationId(1)).await;
    assert!(Arc::ptr_eq(&first, &second));

    let other = rooms.write_lock(ConversationId(2)).await;
    assert!(!Arc::ptr_eq(&first, &other));
}
