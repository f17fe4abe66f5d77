use std::{
    collections::VecDeque,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use shared::protocol::{ClientCommand, ServerEvent};

use crate::{
    cache::LocalStore,
    transport::{ResilientTransport, TransportError},
};

const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(500);

/// One deferred command. Serializable so the queue can be snapshotted to
/// disk and survive a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedCommand {
    pub client_ref: Uuid,
    pub command: ClientCommand,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A queued command reached the server; the acknowledgment event, if
    /// any, has already been applied to the local store.
    Replayed {
        client_ref: Uuid,
        event: Option<Box<ServerEvent>>,
    },
    /// A command was dead-lettered after exhausting its retries or hitting a
    /// permanent rejection.
    Failed { client_ref: Uuid, error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The queue is empty; every command was replayed or dead-lettered.
    Drained,
    /// The circuit breaker refused further traffic; the head command keeps
    /// its retry budget and replay resumes on the next flush.
    Paused,
}

/// Replays commands accepted while offline, strictly in enqueue order. The
/// head command is retried in place with exponential backoff so nothing
/// behind it can overtake; a command that exhausts its budget is
/// dead-lettered and the queue moves on.
pub struct OfflineSyncEngine {
    transport: Arc<ResilientTransport>,
    store: Arc<LocalStore>,
    queue: StdMutex<VecDeque<QueuedCommand>>,
    flush_gate: Mutex<()>,
    events: broadcast::Sender<SyncEvent>,
    max_retries: u32,
    base_backoff: Duration,
}

impl OfflineSyncEngine {
    pub fn new(transport: Arc<ResilientTransport>, store: Arc<LocalStore>) -> Self {
        Self::with_retry_policy(transport, store, DEFAULT_MAX_RETRIES, DEFAULT_BASE_BACKOFF)
    }

    pub fn with_retry_policy(
        transport: Arc<ResilientTransport>,
        store: Arc<LocalStore>,
        max_retries: u32,
        base_backoff: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            transport,
            store,
            queue: StdMutex::new(VecDeque::new()),
            flush_gate: Mutex::new(()),
            events,
            max_retries,
            base_backoff,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Accepts a command for eventual replay. Commands without a client
    /// reference get one minted here so cancellation and ack matching work
    /// uniformly.
    pub fn enqueue(&self, command: ClientCommand) -> Uuid {
        let client_ref = command.client_ref().unwrap_or_else(Uuid::new_v4);
        let mut queue = self.queue.lock().expect("queue lock");
        queue.push_back(QueuedCommand {
            client_ref,
            command,
            enqueued_at: Utc::now(),
            retry_count: 0,
        });
        client_ref
    }

    /// Withdraws a not-yet-replayed command and its provisional record.
    pub fn cancel(&self, client_ref: Uuid) -> bool {
        let removed = {
            let mut queue = self.queue.lock().expect("queue lock");
            let before = queue.len();
            queue.retain(|item| item.client_ref != client_ref);
            queue.len() < before
        };
        if removed {
            self.store.remove_provisional(client_ref);
        }
        removed
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().expect("queue lock").len()
    }

    pub fn queued(&self) -> Vec<QueuedCommand> {
        self.queue.lock().expect("queue lock").iter().cloned().collect()
    }

    /// Serialized queue contents for durable storage.
    pub fn snapshot(&self) -> serde_json::Result<String> {
        let queue = self.queue.lock().expect("queue lock");
        serde_json::to_string(&queue.iter().collect::<Vec<_>>())
    }

    /// Restores a snapshot taken by a previous process, behind any commands
    /// already queued in this one.
    pub fn restore(&self, snapshot: &str) -> serde_json::Result<usize> {
        let items: Vec<QueuedCommand> = serde_json::from_str(snapshot)?;
        let restored = items.len();
        let mut queue = self.queue.lock().expect("queue lock");
        queue.extend(items);
        Ok(restored)
    }

    /// Drains the queue head-first. Only one flush runs at a time; callers
    /// racing here (reconnect plus an explicit refresh) serialize on the
    /// gate instead of double-sending.
    pub async fn flush(&self) -> FlushOutcome {
        let _gate = self.flush_gate.lock().await;

        loop {
            let Some(head) = self.peek_head() else {
                return FlushOutcome::Drained;
            };

            match self.transport.post("/commands", &head.command).await {
                Ok(value) => {
                    let event = match serde_json::from_value::<Option<ServerEvent>>(value) {
                        Ok(event) => event,
                        Err(err) => {
                            warn!(client_ref = %head.client_ref, %err, "unreadable ack; treating as accepted");
                            None
                        }
                    };
                    if let Some(event) = &event {
                        self.store.apply_event(event);
                    }
                    self.pop_head(head.client_ref);
                    info!(client_ref = %head.client_ref, "replayed queued command");
                    let _ = self.events.send(SyncEvent::Replayed {
                        client_ref: head.client_ref,
                        event: event.map(Box::new),
                    });
                }
                Err(TransportError::CircuitOpen) => {
                    // Being refused admission is not a failed attempt; the
                    // head keeps its retry budget.
                    return FlushOutcome::Paused;
                }
                Err(err) if err.is_transient() => {
                    // A cancel may have raced the in-flight attempt.
                    let Some(retry_count) = self.bump_retry(head.client_ref) else {
                        continue;
                    };
                    if retry_count > self.max_retries {
                        self.dead_letter(head.client_ref, &err);
                        continue;
                    }
                    let backoff = self.base_backoff * 2u32.saturating_pow(retry_count - 1);
                    warn!(
                        client_ref = %head.client_ref,
                        retry_count,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient replay failure; backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    // Permanent rejection: dead-letter immediately so a
                    // poisoned command cannot block everything behind it.
                    self.dead_letter(head.client_ref, &err);
                }
            }
        }
    }

    fn peek_head(&self) -> Option<QueuedCommand> {
        self.queue.lock().expect("queue lock").front().cloned()
    }

    fn pop_head(&self, client_ref: Uuid) {
        let mut queue = self.queue.lock().expect("queue lock");
        if queue.front().is_some_and(|item| item.client_ref == client_ref) {
            queue.pop_front();
        }
    }

    fn bump_retry(&self, client_ref: Uuid) -> Option<u32> {
        let mut queue = self.queue.lock().expect("queue lock");
        match queue.front_mut() {
            Some(item) if item.client_ref == client_ref => {
                item.retry_count += 1;
                Some(item.retry_count)
            }
            _ => None,
        }
    }

    fn dead_letter(&self, client_ref: Uuid, err: &TransportError) {
        warn!(client_ref = %client_ref, %err, "dead-lettering queued command");
        self.pop_head(client_ref);
        self.store.mark_failed(client_ref);
        let _ = self.events.send(SyncEvent::Failed {
            client_ref,
            error: err.to_string(),
        });
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
