//! # meterlink
//!
//! A reliable channel to utility meters and their radio gateways over an
//! unreliable serial line.
//!
//! This library tolerates partial reads, interleaved or corrupted frames, lost
//! acknowledgments and slow consumers, and exposes a request/response API plus
//! batched notifications.
//!
//! ## Features
//!
//! - Async/await based API using Tokio
//! - Stop-and-wait ARQ with CRC-16 checked frames for packet radios
//! - Streaming extraction of balanced markup fragments
//! - Failures reported as values, never as panics
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use meterlink::{ChannelConfig, MeterLink, Outcome, SessionOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), meterlink::Error> {
//!     let meters = MeterLink::new();
//!     let id = meters
//!         .open_channel(ChannelConfig::new("/dev/ttyUSB0"), SessionOptions::default())
//!         .await?;
//!     meters.initialize_session(id).await?;
//!
//!     match meters.send_and_wait(id, &b"\x30"[..], Duration::from_secs(2), 2).await? {
//!         Outcome::Success(response) => println!("ok: {response:?}"),
//!         other => println!("command failed: {other:?}"),
//!     }
//!
//!     meters.close_channel(id).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized into several modules, leaf first:
//!
//! - [`transport`] - Exclusive access to one serial channel
//! - [`link`] - ARQ framing with sequence numbers and retransmission
//! - [`message`] - Markup fragment extraction from a byte stream
//! - [`command`] - Command/response exchanges with retries
//! - [`event`] - Timer-driven batching of unsolicited traffic
//! - [`client`] - The [`MeterLink`] controller tying them together
//! - [`log`] - Per-category logging switches

pub mod client;
pub mod command;
pub mod error;
pub mod event;
pub mod link;
pub mod log;
pub mod message;
pub mod transport;

// Re-exports for convenience
pub use client::{ChannelId, LinkMode, MeterLink, Notification, ReplyFormat, SessionOptions};
pub use command::{
    CodeReply, CommandEngine, EngineConfig, MarkupReply, Outcome, ReplyCode, ReplyDecoder,
    Response, Verdict,
};
pub use error::{Error, FrameError, LinkError, Result};
pub use event::{BatchQueue, FlushResult, QueueConfig, Queued, SubscriptionId, Subscribers, Transition};
pub use link::{ArqConfig, ArqLink, Frame, FrameDecoder, FrameKind, LinkState};
pub use log::LogCategories;
pub use message::{Fragment, MessageFramer};
pub use transport::{ChannelConfig, ChannelLock, Conduit, TransportGuard, list_ports};
