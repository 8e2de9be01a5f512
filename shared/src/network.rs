//! Connectivity tracking.
//!
//! The shell reports platform connectivity through [`NetworkMonitor::set_online`].
//! Consumers either read the current state through a [`Connectivity`] handle or
//! get told about offline→online transitions through a [`ReconnectHandler`]
//! that is handed to the monitor explicitly.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const RECONNECT_CHANNEL_CAPACITY: usize = 16;

#[async_trait]
pub trait ReconnectHandler: Send + Sync + 'static {
    async fn on_reconnect(&self);
}

#[async_trait]
impl<H: ReconnectHandler> ReconnectHandler for Arc<H> {
    async fn on_reconnect(&self) {
        self.as_ref().on_reconnect().await;
    }
}

/// Read-only view of the current connectivity.
#[derive(Debug, Clone)]
pub struct Connectivity {
    rx: watch::Receiver<bool>,
}

impl Connectivity {
    pub fn is_online(&self) -> bool {
        *self.rx.borrow()
    }

    /// Waits for the next connectivity change. Returns `None` once the monitor is gone.
    pub async fn changed(&mut self) -> Option<bool> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}

#[derive(Debug)]
pub struct NetworkMonitor {
    state_tx: watch::Sender<bool>,
    reconnect_tx: broadcast::Sender<()>,
}

impl NetworkMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (state_tx, _) = watch::channel(initially_online);
        let (reconnect_tx, _) = broadcast::channel(RECONNECT_CHANNEL_CAPACITY);
        Self {
            state_tx,
            reconnect_tx,
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state_tx.borrow()
    }

    pub fn handle(&self) -> Connectivity {
        Connectivity {
            rx: self.state_tx.subscribe(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state_tx.subscribe()
    }

    /// Receives one message per offline→online transition.
    pub fn subscribe_reconnects(&self) -> broadcast::Receiver<()> {
        self.reconnect_tx.subscribe()
    }

    /// Records the platform's connectivity. Returns true if this was a reconnect.
    pub fn set_online(&self, online: bool) -> bool {
        let was_online = self.state_tx.send_replace(online);
        if was_online == online {
            return false;
        }

        if online {
            info!("network: back online");
            // no listener is not an error
            let _ = self.reconnect_tx.send(());
            true
        } else {
            warn!("network: went offline");
            false
        }
    }

    /// Calls `handler` once per reconnect until the monitor is dropped.
    /// Reconnects that pile up while the handler is busy collapse into one call.
    pub fn spawn_reconnect_listener<H: ReconnectHandler>(&self, handler: H) -> JoinHandle<()> {
        let mut reconnects = self.subscribe_reconnects();
        tokio::spawn(async move {
            loop {
                match reconnects.recv().await {
                    Ok(()) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "network: coalescing missed reconnects");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                while reconnects.try_recv().is_ok() {}
                handler.on_reconnect().await;
            }
        })
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
