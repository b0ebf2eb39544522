//! ARQ link layer for packet radios.
//!
//! This module contains:
//! - Frame encoding/decoding with a trailing CRC-16
//! - The stop-and-wait [`ArqLink`] that retransmits unacknowledged frames

pub mod arq;
pub mod frame;

pub use arq::{ArqConfig, ArqLink, LinkState};
pub use frame::{Frame, FrameDecoder, FrameKind, MAX_PAYLOAD, SEQUENCE_MODULUS, next_sequence};
