//! Network availability monitor.
//!
//! Turns the platform's connectivity signal into a process-wide
//! online/offline flag. Only the monitor writes the flag; every entity worker
//! and the status aggregator hold a read-only [`watch::Receiver`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Connectivity as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    /// Writes may be sent.
    Online,
    /// Writes are held back.
    Offline,
}

impl Connectivity {
    /// Whether this is `Online`.
    pub fn is_online(self) -> bool {
        self == Connectivity::Online
    }
}

/// Process-wide connectivity flag. Cheap to clone; clones share the flag.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<Connectivity>>,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(Connectivity::Online)
    }
}

impl NetworkMonitor {
    /// Creates a monitor with an initial state.
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Records a connectivity signal. Repeated signals with the same value
    /// are ignored. Returns true on an actual transition.
    pub fn set(&self, connectivity: Connectivity) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == connectivity {
                false
            } else {
                *current = connectivity;
                true
            }
        });
        if changed {
            info!("Network is now {:?}", connectivity);
        }
        changed
    }

    /// Shorthand for `set(Online)` / `set(Offline)`.
    pub fn set_online(&self, online: bool) -> bool {
        self.set(if online {
            Connectivity::Online
        } else {
            Connectivity::Offline
        })
    }

    /// Current connectivity.
    pub fn connectivity(&self) -> Connectivity {
        *self.tx.borrow()
    }

    /// Whether the network is currently online.
    pub fn is_online(&self) -> bool {
        self.connectivity().is_online()
    }

    /// Subscribes to transitions.
    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }

    /// Waits until the network is online.
    pub async fn wait_online(&self) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so this only fails if it was dropped.
        let _ = rx.wait_for(|c| c.is_online()).await;
    }
}

/// Waits for the next connectivity transition seen by `rx`. Never returns if
/// the monitor has been dropped.
pub async fn next_transition(rx: &mut watch::Receiver<Connectivity>) -> Connectivity {
    if rx.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
    *rx.borrow_and_update()
}
