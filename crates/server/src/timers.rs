use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::task::JoinHandle;
use uuid::Uuid;

use shared::domain::MessageId;

/// Keys for the two timer families the lifecycle arms. Scheduled sends key
/// on the client reference (no server message id exists yet); ephemeral
/// expiries key on the message they will tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Scheduled(Uuid),
    Ephemeral(MessageId),
}

/// Cancelable timer registry. Arming an existing key replaces its timer;
/// canceling aborts the pending fire so nothing runs against torn-down
/// state. Timers live in memory only and do not survive a restart.
#[derive(Default)]
pub struct TimerRegistry {
    tasks: Mutex<HashMap<TimerKey, JoinHandle<()>>>,
}

impl TimerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn arm<F>(self: &Arc<Self>, key: TimerKey, delay: Duration, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let registry = Arc::clone(self);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            work.await;
            registry.tasks.lock().expect("timer lock").remove(&task_key);
        });

        let mut tasks = self.tasks.lock().expect("timer lock");
        if let Some(previous) = tasks.insert(key, handle) {
            previous.abort();
        }
    }

    pub fn cancel(&self, key: &TimerKey) -> bool {
        let mut tasks = self.tasks.lock().expect("timer lock");
        match tasks.remove(key) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().expect("timer lock").len()
    }
}
