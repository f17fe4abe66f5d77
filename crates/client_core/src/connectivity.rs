use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Online,
    Connecting,
    Offline,
}

/// Funnel for connectivity signals. Several sources report here (socket
/// lifecycle, request failures, explicit app hints); observers see one
/// deduplicated stream of status changes.
pub struct ConnectivityMonitor {
    tx: watch::Sender<ConnectionStatus>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityMonitor {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionStatus::Offline);
        Self { tx }
    }

    /// Reporting the current status again is a no-op; observers are only
    /// notified on actual transitions.
    pub fn set(&self, status: ConnectionStatus) {
        self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                info!(?status, "connectivity changed");
                *current = status;
                true
            }
        });
    }

    pub fn current(&self) -> ConnectionStatus {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }
}
