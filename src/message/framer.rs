//! Extracts complete markup fragments from an arbitrarily chunked byte stream.

use bytes::{Buf, BytesMut};

use crate::log;
use crate::message::Fragment;
use crate::message::scan::{Scan, scan_fragment};

/// Accumulates received bytes and yields complete, well-formed fragments.
///
/// Bytes before the first open marker are noise and are discarded. An
/// incomplete trailing fragment stays buffered for the next [`feed`]; a
/// malformed one is dropped and scanning resumes at the next open marker.
///
/// [`feed`]: MessageFramer::feed
#[derive(Debug, Default)]
pub struct MessageFramer {
    unread: BytesMut,
    dropped: usize,
    trace: bool,
}

impl MessageFramer {
    /// Creates an empty framer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a framer that traces every fragment under `meterlink::message`.
    #[must_use]
    pub fn with_tracing(trace: bool) -> Self {
        Self {
            trace,
            ..Self::default()
        }
    }

    /// Appends `data` and returns every fragment completed by it, in order.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Fragment> {
        self.unread.extend_from_slice(data);

        let mut messages = Vec::new();
        let mut consumed = 0;
        loop {
            let Some(offset) = self.unread[consumed..].iter().position(|&b| b == b'<') else {
                consumed = self.unread.len();
                break;
            };
            let start = consumed + offset;
            consumed = start;

            match scan_fragment(&self.unread, start) {
                Scan::Complete { end, name } => {
                    match Fragment::parse(&self.unread[start..end], name.start - start..name.end - start)
                    {
                        Ok(fragment) => {
                            if self.trace {
                                tracing::trace!(
                                    target: log::MESSAGE,
                                    name = fragment.name(),
                                    len = fragment.len(),
                                    "fragment complete"
                                );
                            }
                            messages.push(fragment);
                        }
                        Err(reason) => self.drop_malformed(start, end, &reason),
                    }
                    consumed = end;
                }
                Scan::Skip { end } => consumed = end,
                Scan::Malformed { resume, reason } => {
                    self.drop_malformed(start, resume, reason);
                    consumed = resume;
                }
                Scan::Incomplete => break,
            }
        }

        self.unread.advance(consumed);
        messages
    }

    fn drop_malformed(&mut self, start: usize, end: usize, reason: &str) {
        self.dropped += 1;
        tracing::debug!(
            target: log::MESSAGE,
            len = end - start,
            "dropping malformed fragment: {}",
            reason
        );
    }

    /// Returns the number of bytes waiting for more data.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.unread.len()
    }

    /// Returns how many malformed fragments have been dropped.
    #[must_use]
    pub const fn dropped(&self) -> usize {
        self.dropped
    }
}
