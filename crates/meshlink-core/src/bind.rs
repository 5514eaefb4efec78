//! Tunnel device bind contract.
//!
//! The encrypted tunnel device pulls received packets in batches and pushes
//! outgoing packets toward an [`Endpoint`]. Implementations of [`Bind`] adapt
//! the engine's transports to that contract.

use crate::endpoint::Endpoint;
use crate::error::Result;
use async_trait::async_trait;

/// Batch packet I/O consumed by the tunnel device
#[async_trait]
pub trait Bind: Send + Sync {
    /// Fill up to `bufs.len()` packets.
    ///
    /// For each returned packet `i`, `sizes[i]` holds its length and
    /// `endpoints[i]` its source. Returns the number of packets written; the
    /// caller reuses `bufs` across calls. All three slices have equal length,
    /// no larger than [`Bind::batch_size`].
    ///
    /// # Errors
    /// Returns an error when the underlying path is closed.
    async fn receive_batch(
        &self,
        bufs: &mut [Vec<u8>],
        sizes: &mut [usize],
        endpoints: &mut [Option<Endpoint>],
    ) -> Result<usize>;

    /// Send every buffer to `endpoint`
    ///
    /// # Errors
    /// Returns an error if no path serves `endpoint` or the write fails.
    async fn send(&self, bufs: &[&[u8]], endpoint: &Endpoint) -> Result<()>;

    /// Preferred batch size for [`Bind::receive_batch`]
    fn batch_size(&self) -> usize;
}
