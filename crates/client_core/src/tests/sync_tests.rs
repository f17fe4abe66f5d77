use super::*;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use chrono::Utc;
use tokio::sync::Mutex as TokioMutex;

use shared::{
    domain::{ConversationId, MessageId, MessageStatus, UserId},
    error::ApiError,
    protocol::MessageRecord,
};

use crate::transport::TransportConfig;

struct CommandServer {
    received: TokioMutex<Vec<Uuid>>,
    attempts: AtomicUsize,
    fail_next: AtomicUsize,
    reject_all: AtomicUsize,
    next_message_id: AtomicI64,
}

async fn handle_command(
    State(server): State<Arc<CommandServer>>,
    Json(command): Json<ClientCommand>,
) -> Result<Json<Option<ServerEvent>>, (StatusCode, Json<ApiError>)> {
    server.attempts.fetch_add(1, Ordering::SeqCst);

    if server.reject_all.load(Ordering::SeqCst) == 1 {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError::validation("rejected")),
        ));
    }
    if server
        .fail_next
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiError::internal("induced failure")),
        ));
    }

    let ClientCommand::SendMessage {
        client_ref,
        conversation_id,
        user_id,
        message,
    } = command
    else {
        return Ok(Json(None));
    };

    server.received.lock().await.push(client_ref);
    let message_id = server.next_message_id.fetch_add(1, Ordering::SeqCst);
    Ok(Json(Some(ServerEvent::Message {
        message: MessageRecord {
            message_id: MessageId(message_id),
            client_ref,
            conversation_id,
            sender_id: user_id,
            content: message,
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
            reactions: Default::default(),
            poll: None,
        },
    })))
}

async fn spawn_command_server() -> (String, Arc<CommandServer>) {
    let server = Arc::new(CommandServer {
        received: TokioMutex::new(Vec::new()),
        attempts: AtomicUsize::new(0),
        fail_next: AtomicUsize::new(0),
        reject_all: AtomicUsize::new(0),
        next_message_id: AtomicI64::new(100),
    });
    let app = Router::new()
        .route("/commands", post(handle_command))
        .with_state(Arc::clone(&server));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (format!("http://{addr}"), server)
}

fn engine(base: &str, threshold: u32, max_retries: u32) -> (OfflineSyncEngine, Arc<LocalStore>) {
    let transport = Arc::new(ResilientTransport::new(TransportConfig {
        base_url: base.to_string(),
        request_timeout: Duration::from_secs(5),
        failure_threshold: threshold,
        cooldown: Duration::from_secs(60),
    }));
    let store = Arc::new(LocalStore::new());
    let engine = OfflineSyncEngine::with_retry_policy(
        transport,
        Arc::clone(&store),
        max_retries,
        Duration::from_millis(1),
    );
    (engine, store)
}

fn send_command(conversation: i64, text: &str) -> ClientCommand {
    ClientCommand::SendMessage {
        client_ref: Uuid::new_v4(),
        conversation_id: ConversationId(conversation),
        user_id: UserId(7),
        message: text.to_string(),
    }
}

#[tokio::test]
async fn flush_replays_in_strict_enqueue_order() {
    let (base, server) = spawn_command_server().await;
    let (engine, store) = engine(&base, 5, 3);

    let mut expected = Vec::new();
    for text in ["first", "second", "third"] {
        let cmd = send_command(1, text);
        let client_ref = cmd.client_ref().expect("ref");
        store.insert_provisional(client_ref, ConversationId(1), UserId(7), text);
        engine.enqueue(cmd);
        expected.push(client_ref);
    }

    assert_eq!(engine.flush().await, FlushOutcome::Drained);
    assert_eq!(engine.pending(), 0);
    assert_eq!(*server.received.lock().await, expected);

    // Every provisional record was reconciled to its server-assigned id.
    let messages = store.messages(ConversationId(1));
    assert_eq!(messages.len(), 3);
    assert!(messages.iter().all(|m| m.message_id.0 >= 100));
    assert!(messages.iter().all(|m| m.status == MessageStatus::Sent));
    assert_eq!(messages[0].content, "first");
    assert_eq!(messages[2].content, "third");
}

#[tokio::test]
async fn transient_failures_retry_the_head_in_place() {
    let (base, server) = spawn_command_server().await;
    server.fail_next.store(2, Ordering::SeqCst);
    let (engine, _store) = engine(&base, 10, 5);

    engine.enqueue(send_command(1, "persistent"));
    engine.enqueue(send_command(1, "behind"));

    assert_eq!(engine.flush().await, FlushOutcome::Drained);
    // Two failures for the head, then both commands succeed.
    assert_eq!(server.attempts.load(Ordering::SeqCst), 4);
    assert_eq!(server.received.lock().await.len(), 2);
}

#[tokio::test]
async fn retry_ceiling_dead_letters_and_the_queue_moves_on() {
    let (base, server) = spawn_command_server().await;
    server.fail_next.store(3, Ordering::SeqCst);
    let (engine, store) = engine(&base, 100, 2);
    let mut events = engine.subscribe();

    let doomed = send_command(1, "doomed");
    let doomed_ref = doomed.client_ref().expect("ref");
    store.insert_provisional(doomed_ref, ConversationId(1), UserId(7), "doomed");
    engine.enqueue(doomed);
    engine.enqueue(send_command(1, "survivor"));

    assert_eq!(engine.flush().await, FlushOutcome::Drained);

    // Initial attempt plus two retries, then dead-letter; the survivor goes
    // straight through.
    match events.recv().await.expect("event") {
        SyncEvent::Failed { client_ref, .. } => assert_eq!(client_ref, doomed_ref),
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(server.received.lock().await.len(), 1);
    assert_eq!(
        store.messages(ConversationId(1))[0].status,
        MessageStatus::Failed
    );
}

#[tokio::test]
async fn permanent_rejection_dead_letters_without_retrying() {
    let (base, server) = spawn_command_server().await;
    server.reject_all.store(1, Ordering::SeqCst);
    let (engine, _store) = engine(&base, 100, 5);

    engine.enqueue(send_command(1, "poisoned"));
    assert_eq!(engine.flush().await, FlushOutcome::Drained);
    assert_eq!(server.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(engine.pending(), 0);
}

#[tokio::test]
async fn open_breaker_pauses_the_flush_without_consuming_retries() {
    let (base, server) = spawn_command_server().await;
    server.fail_next.store(10, Ordering::SeqCst);
    // Threshold 1: the first failure opens the breaker; the retry is then
    // refused admission and the flush pauses.
    let (engine, _store) = engine(&base, 1, 5);

    engine.enqueue(send_command(1, "waiting"));
    engine.enqueue(send_command(1, "also waiting"));

    assert_eq!(engine.flush().await, FlushOutcome::Paused);
    let queued = engine.queued();
    assert_eq!(queued.len(), 2);
    assert_eq!(queued[0].retry_count, 1);
    assert_eq!(queued[1].retry_count, 0);
    assert_eq!(server.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancel_withdraws_a_queued_command_and_its_provisional_record() {
    let (base, _server) = spawn_command_server().await;
    let (engine, store) = engine(&base, 5, 5);

    let cmd = send_command(1, "never mind");
    let client_ref = cmd.client_ref().expect("ref");
    store.insert_provisional(client_ref, ConversationId(1), UserId(7), "never mind");
    engine.enqueue(cmd);

    assert!(engine.cancel(client_ref));
    assert!(!engine.cancel(client_ref));
    assert_eq!(engine.pending(), 0);
    assert!(store.messages(ConversationId(1)).is_empty());
}

#[tokio::test]
async fn snapshot_round_trips_through_a_restart() {
    let (base, server) = spawn_command_server().await;
    let (engine, _store) = engine(&base, 5, 5);
    engine.enqueue(send_command(1, "persisted"));
    engine.enqueue(send_command(2, "also persisted"));
    let snapshot = engine.snapshot().expect("snapshot");

    let (revived, _store) = self::engine(&base, 5, 5);
    assert_eq!(revived.restore(&snapshot).expect("restore"), 2);
    assert_eq!(revived.pending(), 2);
    assert_eq!(revived.flush().await, FlushOutcome::Drained);
    assert_eq!(server.received.lock().await.len(), 2);
}
