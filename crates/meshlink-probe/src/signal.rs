//! In-process signaling bus.
//!
//! [`LocalBus`] connects any number of peers living in one process. Each peer
//! gets a [`LocalChannel`] stamped with its id; payloads are queued per
//! subscriber and handed to its [`SignalHandler`] by one dispatch task, so a
//! slow handler delays only its own peer's traffic.

use async_trait::async_trait;
use dashmap::DashMap;
use meshlink_core::{CoreError, PeerId, SignalChannel, SignalHandler};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Default per-subscriber queue depth
pub const DEFAULT_QUEUE: usize = 256;

struct Delivery {
    from: PeerId,
    payload: Vec<u8>,
}

/// Shared bus
#[derive(Clone)]
pub struct LocalBus {
    subscribers: Arc<DashMap<PeerId, mpsc::Sender<Delivery>>>,
    queue: usize,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    /// Bus with [`DEFAULT_QUEUE`] slots per subscriber
    #[must_use]
    pub fn new() -> Self {
        Self::with_queue(DEFAULT_QUEUE)
    }

    /// Bus with `queue` slots per subscriber
    #[must_use]
    pub fn with_queue(queue: usize) -> Self {
        Self {
            subscribers: Arc::new(DashMap::new()),
            queue: queue.max(1),
        }
    }

    /// Channel sending as `local`
    #[must_use]
    pub fn channel(&self, local: PeerId) -> LocalChannel {
        LocalChannel {
            bus: self.clone(),
            local,
        }
    }

    /// Drop `peer`'s subscription; its dispatch task drains and exits
    pub fn unsubscribe(&self, peer: &PeerId) {
        self.subscribers.remove(peer);
    }

    /// Whether `peer` has a handler
    #[must_use]
    pub fn is_subscribed(&self, peer: &PeerId) -> bool {
        self.subscribers.contains_key(peer)
    }

    fn deliver(&self, from: PeerId, to: PeerId, payload: Vec<u8>) -> meshlink_core::Result<()> {
        let sender = self
            .subscribers
            .get(&to)
            .map(|s| s.clone())
            .ok_or_else(|| CoreError::signal(to, "no subscriber"))?;

        match sender.try_send(Delivery { from, payload }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%from, %to, "signal queue full, dropping payload");
                Err(CoreError::signal(to, "queue full"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(CoreError::signal(to, "subscriber gone")),
        }
    }

    fn subscribe(&self, local: PeerId, handler: Arc<dyn SignalHandler>) {
        let (tx, mut rx) = mpsc::channel::<Delivery>(self.queue);
        if self.subscribers.insert(local, tx).is_some() {
            debug!(peer = %local, "replacing signal subscriber");
        }

        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                trace!(peer = %local, from = %delivery.from, len = delivery.payload.len(), "signal delivered");
                handler.on_signal(delivery.from, &delivery.payload).await;
            }
            trace!(peer = %local, "signal dispatch stopped");
        });
    }
}

impl std::fmt::Debug for LocalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBus")
            .field("subscribers", &self.subscribers.len())
            .field("queue", &self.queue)
            .finish()
    }
}

/// One peer's view of a [`LocalBus`]
#[derive(Clone, Debug)]
pub struct LocalChannel {
    bus: LocalBus,
    local: PeerId,
}

impl LocalChannel {
    /// Sending peer
    #[must_use]
    pub fn local(&self) -> PeerId {
        self.local
    }
}

#[async_trait]
impl SignalChannel for LocalChannel {
    async fn send(&self, peer: PeerId, payload: Vec<u8>) -> meshlink_core::Result<()> {
        self.bus.deliver(self.local, peer, payload)
    }

    fn subscribe(&self, local: PeerId, handler: Arc<dyn SignalHandler>) {
        if local != self.local {
            warn!(%local, channel = %self.local, "subscribing through another peer's channel");
        }
        self.bus.subscribe(local, handler);
    }
}
