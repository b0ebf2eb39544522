//! Per-category log switches.
//!
//! Every layer logs through `tracing` under its own target so a subscriber
//! can filter them with an env-filter such as `meterlink::link=trace`. The
//! [`LogCategories`] flags additionally gate the chattiest output (raw bytes
//! and per-frame traces) at the source.

/// Target for raw byte dumps.
pub const RAW: &str = "meterlink::raw";
/// Target for link-layer frames.
pub const LINK: &str = "meterlink::link";
/// Target for extracted markup fragments.
pub const MESSAGE: &str = "meterlink::message";
/// Target for command/response and event traffic.
pub const APP: &str = "meterlink::app";

/// Log verbosity flags by category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct LogCategories {
    /// Dump every byte read or written.
    pub raw_bytes: bool,
    /// Trace every link-layer frame.
    pub link_frames: bool,
    /// Trace every extracted message fragment.
    pub message_frames: bool,
    /// Trace command exchanges and event batches.
    pub application: bool,
}

impl LogCategories {
    /// All categories disabled.
    pub const NONE: Self = Self {
        raw_bytes: false,
        link_frames: false,
        message_frames: false,
        application: false,
    };

    /// All categories enabled.
    pub const ALL: Self = Self {
        raw_bytes: true,
        link_frames: true,
        message_frames: true,
        application: true,
    };
}

impl Default for LogCategories {
    fn default() -> Self {
        Self {
            raw_bytes: false,
            link_frames: false,
            message_frames: false,
            application: true,
        }
    }
}

/// Logs a raw byte dump when enabled.
pub(crate) fn raw(enabled: bool, direction: &str, channel: &str, bytes: &[u8]) {
    if enabled && !bytes.is_empty() {
        tracing::trace!(target: RAW, channel, len = bytes.len(), "{direction} {}", hex::encode(bytes));
    }
}
