use std::{
    collections::HashSet,
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};
use uuid::Uuid;

use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{ClientCommand, ConversationRecord, MessageRecord, ServerEvent},
};

pub mod cache;
pub mod connectivity;
pub mod sync;
pub mod transport;

use cache::LocalStore;
use connectivity::{ConnectionStatus, ConnectivityMonitor};
use sync::{FlushOutcome, OfflineSyncEngine, SyncEvent};
use transport::{ResilientTransport, TransportConfig};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub auth_token: String,
    pub transport: TransportConfig,
    pub reconnect_floor: Duration,
    pub reconnect_ceiling: Duration,
    pub sync_max_retries: u32,
    pub sync_base_backoff: Duration,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        let server_url = server_url.into();
        Self {
            transport: TransportConfig::new(server_url.clone()),
            server_url,
            auth_token: auth_token.into(),
            reconnect_floor: Duration::from_secs(1),
            reconnect_ceiling: Duration::from_secs(30),
            sync_max_retries: 5,
            sync_base_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Server(ServerEvent),
    Sync(SyncEvent),
    Connectivity(ConnectionStatus),
    Error(String),
}

struct ClientInner {
    joined: HashSet<ConversationId>,
    outbound: Option<mpsc::Sender<ClientCommand>>,
    supervisor: Option<JoinHandle<()>>,
    flusher: Option<JoinHandle<()>>,
}

/// Client facade tying the pieces together: optimistic local store, offline
/// replay queue, breaker-guarded HTTP transport, and the event socket with
/// its reconnect loop.
pub struct MessagingClient {
    config: ClientConfig,
    pub transport: Arc<ResilientTransport>,
    pub store: Arc<LocalStore>,
    pub sync: Arc<OfflineSyncEngine>,
    connectivity: ConnectivityMonitor,
    events: broadcast::Sender<ClientEvent>,
    inner: Mutex<ClientInner>,
}

impl MessagingClient {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let transport = Arc::new(ResilientTransport::new(config.transport.clone()));
        let store = Arc::new(LocalStore::new());
        let sync = Arc::new(OfflineSyncEngine::with_retry_policy(
            Arc::clone(&transport),
            Arc::clone(&store),
            config.sync_max_retries,
            config.sync_base_backoff,
        ));
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            config,
            transport,
            store,
            sync,
            connectivity: ConnectivityMonitor::new(),
            events,
            inner: Mutex::new(ClientInner {
                joined: HashSet::new(),
                outbound: None,
                supervisor: None,
                flusher: None,
            }),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connectivity.current()
    }

    /// External connectivity hint (OS network change, app foregrounding).
    /// Going online wakes the replay queue through the same funnel the
    /// socket lifecycle feeds.
    pub fn report_connectivity(&self, status: ConnectionStatus) {
        self.connectivity.set(status);
    }

    /// Queues a command for delivery, inserting a provisional record into
    /// the local store when the command carries visible content. Returns the
    /// client reference used for ack matching and cancellation.
    pub async fn submit(self: &Arc<Self>, command: ClientCommand) -> Uuid {
        if let Some((conversation_id, sender_id, content)) = provisional_content(&command) {
            let client_ref = command.client_ref().unwrap_or_else(Uuid::new_v4);
            self.store
                .insert_provisional(client_ref, conversation_id, sender_id, &content);
        }
        let client_ref = self.sync.enqueue(command);
        if self.connectivity.current() == ConnectionStatus::Online {
            self.flush_in_background();
        }
        client_ref
    }

    pub async fn send_message(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        user_id: UserId,
        text: &str,
    ) -> Uuid {
        self.submit(ClientCommand::SendMessage {
            client_ref: Uuid::new_v4(),
            conversation_id,
            user_id,
            message: text.to_string(),
        })
        .await
    }

    /// Withdraws a queued command before it reaches the server.
    pub fn cancel(&self, client_ref: Uuid) -> bool {
        self.sync.cancel(client_ref)
    }

    /// Subscribes to a conversation's events. Joins are re-sent on every
    /// reconnect since room membership is per-session on the server.
    pub async fn join_conversation(&self, conversation_id: ConversationId) {
        let outbound = {
            let mut inner = self.inner.lock().await;
            inner.joined.insert(conversation_id);
            inner.outbound.clone()
        };
        if let Some(tx) = outbound {
            let _ = tx
                .send(ClientCommand::JoinConversation { conversation_id })
                .await;
        }
    }

    pub async fn fetch_conversations(&self, user_id: UserId) -> Result<Vec<ConversationRecord>> {
        let value = self
            .transport
            .get(&format!("/conversations?user_id={}", user_id.0))
            .await?;
        let conversations: Vec<ConversationRecord> = serde_json::from_value(value)?;
        for conversation in &conversations {
            self.store.upsert_conversation(conversation.clone());
        }
        Ok(conversations)
    }

    pub async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessageRecord>> {
        let mut path = format!(
            "/conversations/{}/messages?limit={limit}",
            conversation_id.0
        );
        if let Some(before) = before {
            path.push_str(&format!("&before={}", before.0));
        }
        let value = self.transport.get(&path).await?;
        let messages: Vec<MessageRecord> = serde_json::from_value(value)?;
        for message in &messages {
            self.store.apply_event(&ServerEvent::Message {
                message: message.clone(),
            });
        }
        Ok(messages)
    }

    /// Starts the event socket supervisor and the online-flush watcher.
    pub async fn start(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner.supervisor.is_some() {
            return;
        }

        let client = Arc::clone(self);
        inner.flusher = Some(tokio::spawn(async move {
            let mut status_rx = client.connectivity.subscribe();
            loop {
                if *status_rx.borrow_and_update() == ConnectionStatus::Online {
                    client.drive_flush().await;
                    info!("offline queue flush finished");
                }
                if status_rx.changed().await.is_err() {
                    break;
                }
            }
        }));

        let client = Arc::clone(self);
        inner.supervisor = Some(tokio::spawn(async move {
            client.run_socket_loop().await;
        }));

        let client = Arc::clone(self);
        let mut sync_rx = self.sync.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = sync_rx.recv().await {
                let _ = client.events.send(ClientEvent::Sync(event));
            }
        });
    }

    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.supervisor.take() {
            task.abort();
        }
        if let Some(task) = inner.flusher.take() {
            task.abort();
        }
        inner.outbound = None;
        self.connectivity.set(ConnectionStatus::Offline);
    }

    fn flush_in_background(self: &Arc<Self>) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            client.drive_flush().await;
        });
    }

    /// Flushes until the queue drains. A breaker refusal does not end the
    /// replay: the driver waits out the cooldown and tries again, so the
    /// queue cannot stall while the client stays online. Going offline
    /// abandons the wait; the next online transition resumes it.
    async fn drive_flush(&self) {
        loop {
            match self.sync.flush().await {
                FlushOutcome::Drained => return,
                FlushOutcome::Paused => {
                    info!("replay paused by the circuit breaker; waiting out the cooldown");
                    tokio::time::sleep(self.transport.cooldown()).await;
                    if self.connectivity.current() != ConnectionStatus::Online {
                        return;
                    }
                }
            }
        }
    }

    fn ws_url(&self) -> Result<String> {
        let mut url = url::Url::parse(&self.config.server_url)?;
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => return Err(anyhow!("unsupported server_url scheme: {other}")),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot rewrite scheme on {url}"))?;
        url.set_path("/ws");
        url.query_pairs_mut()
            .clear()
            .append_pair("token", &self.config.auth_token);
        Ok(url.into())
    }

    /// Connect, drain, reconnect. Backoff doubles from the floor to the
    /// ceiling across consecutive failures and resets after a healthy
    /// connection.
    async fn run_socket_loop(self: Arc<Self>) {
        let mut backoff = self.config.reconnect_floor;
        loop {
            self.connectivity.set(ConnectionStatus::Connecting);
            match self.run_one_connection().await {
                Ok(()) => {
                    backoff = self.config.reconnect_floor;
                }
                Err(err) => {
                    warn!(%err, "event socket connection failed");
                }
            }
            self.connectivity.set(ConnectionStatus::Offline);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.reconnect_ceiling);
        }
    }

    async fn run_one_connection(self: &Arc<Self>) -> Result<()> {
        let url = self.ws_url()?;
        let (stream, _) = connect_async(&url).await?;
        let (mut writer, mut reader) = stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientCommand>(64);
        let rejoin = {
            let mut inner = self.inner.lock().await;
            inner.outbound = Some(outbound_tx);
            inner.joined.iter().copied().collect::<Vec<_>>()
        };

        let writer_task = tokio::spawn(async move {
            while let Some(command) = outbound_rx.recv().await {
                let Ok(text) = serde_json::to_string(&command) else {
                    continue;
                };
                if writer.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        self.connectivity.set(ConnectionStatus::Online);
        info!("event socket connected");
        for conversation_id in rejoin {
            self.join_conversation(conversation_id).await;
        }

        let result = loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => {
                        self.store.apply_event(&event);
                        let _ = self.events.send(ClientEvent::Server(event));
                    }
                    Err(err) => {
                        let _ = self
                            .events
                            .send(ClientEvent::Error(format!("invalid server event: {err}")));
                    }
                },
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => {}
                Some(Err(err)) => break Err(anyhow!("event socket receive failed: {err}")),
            }
        };

        self.inner.lock().await.outbound = None;
        writer_task.abort();
        result
    }
}

/// Content shown optimistically in the local timeline while the command
/// waits for replay.
fn provisional_content(command: &ClientCommand) -> Option<(ConversationId, UserId, String)> {
    match command {
        ClientCommand::SendMessage {
            conversation_id,
            user_id,
            message,
            ..
        }
        | ClientCommand::SendSecureMessage {
            conversation_id,
            user_id,
            message,
            ..
        }
        | ClientCommand::ScheduleMessage {
            conversation_id,
            user_id,
            message,
            ..
        }
        | ClientCommand::SendEphemeralMessage {
            conversation_id,
            user_id,
            message,
            ..
        } => Some((*conversation_id, *user_id, message.clone())),
        ClientCommand::SendVoiceMessage {
            conversation_id,
            user_id,
            media_url,
            ..
        }
        | ClientCommand::SendSticker {
            conversation_id,
            user_id,
            media_url,
            ..
        } => Some((*conversation_id, *user_id, media_url.clone())),
        _ => None,
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
