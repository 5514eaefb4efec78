//! Signaling seams.
//!
//! The engine does not care how signaling bytes travel (message bus, relay
//! passthrough, HTTP). It sends through a [`SignalChannel`] and receives
//! through a [`SignalHandler`] registered for the local peer. Delivery is
//! at-most-once and unordered across distinct sends.

use crate::error::Result;
use crate::peer::PeerId;
use async_trait::async_trait;
use std::sync::Arc;

/// Outbound signaling
#[async_trait]
pub trait SignalChannel: Send + Sync {
    /// Deliver `payload` to `peer`
    ///
    /// # Errors
    /// Returns [`crate::CoreError::Signal`] when the payload could not be handed off.
    async fn send(&self, peer: PeerId, payload: Vec<u8>) -> Result<()>;

    /// Register the handler receiving payloads addressed to `local`
    fn subscribe(&self, local: PeerId, handler: Arc<dyn SignalHandler>);
}

/// Inbound signaling callback
#[async_trait]
pub trait SignalHandler: Send + Sync {
    /// Called once per received payload; `from` is the transport-level sender
    async fn on_signal(&self, from: PeerId, payload: &[u8]);
}
