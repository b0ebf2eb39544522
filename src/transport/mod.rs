//! Transport layer for meter communication.
//!
//! [`TransportGuard`] owns one physical channel. [`Conduit`] is what the
//! command engine talks to: either the guard itself (raw byte traffic) or an
//! [`ArqLink`](crate::link::ArqLink) layered on top of it.

pub mod guard;
pub mod serial;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use tokio::sync::watch;

use crate::error::Result;
use crate::log::LogCategories;

/// A byte carrier the command engine can drive.
pub trait Conduit: Send + Sync {
    /// Name of the underlying channel, for logging.
    fn name(&self) -> &str;

    /// Sends bytes to the peer.
    fn send(&self, data: Bytes) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Takes whatever bytes have arrived so far. May be empty.
    fn receive(&self) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send + '_>>;

    /// Returns a receiver that changes whenever new bytes become available.
    ///
    /// The counter only flags arrival; readers validate the bytes themselves.
    fn data_ready(&self) -> watch::Receiver<u64>;

    /// Returns true while the conduit can carry traffic.
    fn is_open(&self) -> bool;

    /// Log categories of the underlying channel.
    fn log_categories(&self) -> LogCategories;

    /// Aborts a send in flight. Returns false if there was nothing to abort.
    fn cancel(&self) -> bool {
        false
    }
}

pub use guard::{ChannelLock, TransportGuard};
pub use serial::{ChannelConfig, list_ports};
