use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::warn;

use shared::{
    domain::{ConversationId, SessionId},
    protocol::ServerEvent,
};

/// Room registry: which live sessions are subscribed to which conversation,
/// plus the per-room lock that serializes mutating operations against one
/// conversation's state. Rooms make progress independently of each other.
pub struct Rooms {
    inner: RwLock<RoomsInner>,
    buffer: usize,
}

struct RoomsInner {
    sessions: HashMap<SessionId, mpsc::Sender<ServerEvent>>,
    members: HashMap<ConversationId, HashSet<SessionId>>,
    write_locks: HashMap<ConversationId, Arc<Mutex<()>>>,
    next_session: i64,
}

impl Rooms {
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: RwLock::new(RoomsInner {
                sessions: HashMap::new(),
                members: HashMap::new(),
                write_locks: HashMap::new(),
                next_session: 1,
            }),
            buffer: buffer.max(1),
        }
    }

    /// Registers a connected session and hands back its event receiver.
    pub async fn register_session(&self) -> (SessionId, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut inner = self.inner.write().await;
        let session_id = SessionId(inner.next_session);
        inner.next_session += 1;
        inner.sessions.insert(session_id, tx);
        (session_id, rx)
    }

    /// Joining may precede conversation creation (pre-provisioned rooms);
    /// there is deliberately no error path here.
    pub async fn join(&self, conversation_id: ConversationId, session_id: SessionId) {
        let mut inner = self.inner.write().await;
        if !inner.sessions.contains_key(&session_id) {
            return;
        }
        inner
            .members
            .entry(conversation_id)
            .or_default()
            .insert(session_id);
    }

    /// Drops the session from every room it joined.
    pub async fn unregister_session(&self, session_id: SessionId) {
        let mut inner = self.inner.write().await;
        inner.sessions.remove(&session_id);
        for members in inner.members.values_mut() {
            members.remove(&session_id);
        }
    }

    /// The async mutex guarding writes to one conversation. Callers hold it
    /// across validate-apply-broadcast so no two writers interleave on the
    /// same room.
    pub async fn write_lock(&self, conversation_id: ConversationId) -> Arc<Mutex<()>> {
        let mut inner = self.inner.write().await;
        inner
            .write_locks
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Publishes to every member of the room, the originating session
    /// included. A slow consumer with a full buffer loses the event rather
    /// than stalling the loop; a closed consumer is pruned.
    pub async fn broadcast(&self, conversation_id: ConversationId, event: &ServerEvent) {
        let mut closed = Vec::new();
        {
            let inner = self.inner.read().await;
            let Some(members) = inner.members.get(&conversation_id) else {
                return;
            };
            for session_id in members {
                let Some(tx) = inner.sessions.get(session_id) else {
                    continue;
                };
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            session_id = session_id.0,
                            conversation_id = conversation_id.0,
                            "dropping event for slow consumer"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        closed.push(*session_id);
                    }
                }
            }
        }
        for session_id in closed {
            self.unregister_session(session_id).await;
        }
    }

    /// Direct delivery to a single session, used for `error` events that
    /// must not fan out to the room.
    pub async fn send_to(&self, session_id: SessionId, event: ServerEvent) {
        let inner = self.inner.read().await;
        if let Some(tx) = inner.sessions.get(&session_id) {
            let _ = tx.try_send(event);
        }
    }

    pub async fn member_count(&self, conversation_id: ConversationId) -> usize {
        let inner = self.inner.read().await;
        inner
            .members
            .get(&conversation_id)
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
#[path = "tests/rooms_tests.rs"]
mod tests;
