//! Reply decoding for command exchanges.
//!
//! A [`ReplyDecoder`] sees every byte the engine reads from the channel. It
//! decides when the reply to the current command is complete and hands
//! everything else to an unsolicited sink.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::log;
use crate::message::{Fragment, MessageFramer};

/// Terminal response codes, numbered as in ANSI C12.18.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReplyCode {
    /// Acknowledge; the command succeeded.
    Ok = 0x00,
    /// Rejected for an unspecified reason.
    Err = 0x01,
    /// Service not supported.
    Sns = 0x02,
    /// Insufficient security clearance.
    Isc = 0x03,
    /// Operation not possible.
    Onp = 0x04,
    /// Inappropriate action requested.
    Iar = 0x05,
    /// Device busy.
    Bsy = 0x06,
    /// Data not ready.
    Dnr = 0x07,
    /// Data locked.
    Dlk = 0x08,
    /// Renegotiate request.
    Rno = 0x09,
    /// Invalid service sequence state.
    Isss = 0x0A,
}

impl ReplyCode {
    /// Maps a reply byte, or `None` for bytes outside the enumeration.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Ok),
            0x01 => Some(Self::Err),
            0x02 => Some(Self::Sns),
            0x03 => Some(Self::Isc),
            0x04 => Some(Self::Onp),
            0x05 => Some(Self::Iar),
            0x06 => Some(Self::Bsy),
            0x07 => Some(Self::Dnr),
            0x08 => Some(Self::Dlk),
            0x09 => Some(Self::Rno),
            0x0A => Some(Self::Isss),
            _ => None,
        }
    }

    /// Returns true only for [`ReplyCode::Ok`].
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Returns a short human-readable description.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Err => "rejected",
            Self::Sns => "service not supported",
            Self::Isc => "insufficient security clearance",
            Self::Onp => "operation not possible",
            Self::Iar => "inappropriate action requested",
            Self::Bsy => "device busy",
            Self::Dnr => "data not ready",
            Self::Dlk => "data locked",
            Self::Rno => "renegotiate request",
            Self::Isss => "invalid service sequence state",
        }
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x} ({})", *self as u8, self.description())
    }
}

/// A recognized reply from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// A single terminal reply code.
    Code(ReplyCode),
    /// A terminating markup fragment.
    Markup(Fragment),
}

/// How a decoder judged a complete reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The device accepted the command.
    Accept(Response),
    /// The device answered but refused the command.
    Reject(Response),
}

/// Interprets reply bytes for a command exchange.
pub trait ReplyDecoder: Send {
    /// Feeds bytes read while a command waits for its reply.
    ///
    /// Returns the verdict once the reply is complete. Bytes that do not
    /// belong to the reply stay with the decoder or go to its sink.
    fn feed(&mut self, data: &[u8]) -> Option<Verdict>;

    /// Feeds bytes that arrived while no command was waiting.
    fn unsolicited(&mut self, data: &[u8]);
}

/// Sink for unsolicited markup fragments.
pub type FragmentSink = Arc<dyn Fn(Fragment) + Send + Sync>;

/// Sink for unsolicited raw bytes.
pub type BytesSink = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Decodes single-byte reply codes.
///
/// Bytes outside the [`ReplyCode`] enumeration are skipped and the decoder
/// keeps waiting.
#[derive(Default)]
pub struct CodeReply {
    sink: Option<BytesSink>,
}

impl CodeReply {
    /// Creates a decoder that discards unsolicited bytes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes unsolicited bytes to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: impl Fn(Bytes) + Send + Sync + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }
}

impl ReplyDecoder for CodeReply {
    fn feed(&mut self, data: &[u8]) -> Option<Verdict> {
        for (i, &byte) in data.iter().enumerate() {
            let Some(code) = ReplyCode::from_byte(byte) else {
                tracing::debug!(target: log::APP, "ignoring unrecognized reply byte {:#04x}", byte);
                continue;
            };
            self.unsolicited(&data[i + 1..]);
            let response = Response::Code(code);
            return Some(if code.is_success() {
                Verdict::Accept(response)
            } else {
                Verdict::Reject(response)
            });
        }
        None
    }

    fn unsolicited(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        match &self.sink {
            Some(sink) => sink(Bytes::copy_from_slice(data)),
            None => tracing::trace!(target: log::APP, len = data.len(), "discarding unsolicited bytes"),
        }
    }
}

/// Decodes markup replies through a [`MessageFramer`].
///
/// The reply is the first fragment whose local name matches the terminating
/// tag (accepted) or the reject tag (refused). Every other fragment is
/// unsolicited.
pub struct MarkupReply {
    framer: MessageFramer,
    terminator: String,
    reject: Option<String>,
    sink: Option<FragmentSink>,
}

impl MarkupReply {
    /// Creates a decoder completing on fragments named `terminator`.
    #[must_use]
    pub fn new(terminator: impl Into<String>) -> Self {
        Self {
            framer: MessageFramer::new(),
            terminator: terminator.into(),
            reject: None,
            sink: None,
        }
    }

    /// Fragments named `tag` complete the exchange as rejected.
    #[must_use]
    pub fn reject_on(mut self, tag: impl Into<String>) -> Self {
        self.reject = Some(tag.into());
        self
    }

    /// Routes unsolicited fragments to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: impl Fn(Fragment) + Send + Sync + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// Traces every extracted fragment.
    #[must_use]
    pub fn with_tracing(mut self, trace: bool) -> Self {
        self.framer = MessageFramer::with_tracing(trace);
        self
    }

    /// Returns the framer holding the unread tail.
    #[must_use]
    pub const fn framer(&self) -> &MessageFramer {
        &self.framer
    }

    fn deliver(&self, fragment: Fragment) {
        match &self.sink {
            Some(sink) => sink(fragment),
            None => tracing::debug!(
                target: log::APP,
                name = fragment.name(),
                "discarding unsolicited fragment"
            ),
        }
    }
}

impl ReplyDecoder for MarkupReply {
    fn feed(&mut self, data: &[u8]) -> Option<Verdict> {
        let mut verdict = None;
        for fragment in self.framer.feed(data) {
            if verdict.is_some() {
                self.deliver(fragment);
                continue;
            }
            let name = fragment.local_name();
            if name == self.terminator {
                verdict = Some(Verdict::Accept(Response::Markup(fragment)));
            } else if self.reject.as_deref() == Some(name) {
                verdict = Some(Verdict::Reject(Response::Markup(fragment)));
            } else {
                self.deliver(fragment);
            }
        }
        verdict
    }

    fn unsolicited(&mut self, data: &[u8]) {
        for fragment in self.framer.feed(data) {
            self.deliver(fragment);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_reply_code_mapping() {
        assert_eq!(ReplyCode::from_byte(0x00), Some(ReplyCode::Ok));
        assert_eq!(ReplyCode::from_byte(0x06), Some(ReplyCode::Bsy));
        assert_eq!(ReplyCode::from_byte(0x0A), Some(ReplyCode::Isss));
        assert_eq!(ReplyCode::from_byte(0x0B), None);
        assert_eq!(ReplyCode::from_byte(0xFF), None);
        assert!(ReplyCode::Ok.is_success());
        assert!(!ReplyCode::Dnr.is_success());
    }

    #[test]
    fn test_code_reply_skips_unrecognized_bytes() {
        let mut decoder = CodeReply::new();
        assert_eq!(decoder.feed(&[0xEE, 0x55]), None);
        assert_eq!(
            decoder.feed(&[0x7F, 0x06]),
            Some(Verdict::Reject(Response::Code(ReplyCode::Bsy)))
        );
        assert_eq!(
            decoder.feed(&[0x00]),
            Some(Verdict::Accept(Response::Code(ReplyCode::Ok)))
        );
    }

    #[test]
    fn test_code_reply_forwards_trailing_bytes() {
        let seen = Arc::new(Mutex::new(Vec::<u8>::new()));
        let sink = Arc::clone(&seen);
        let mut decoder =
            CodeReply::new().with_sink(move |bytes| sink.lock().unwrap().extend_from_slice(&bytes));

        let verdict = decoder.feed(&[0x00, 0xA1, 0xA2]);
        assert_eq!(verdict, Some(Verdict::Accept(Response::Code(ReplyCode::Ok))));
        assert_eq!(*seen.lock().unwrap(), [0xA1, 0xA2]);
    }

    #[test]
    fn test_markup_reply_routes_other_fragments() {
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&seen);
        let mut decoder = MarkupReply::new("reply")
            .reject_on("fault")
            .with_sink(move |f: Fragment| sink.lock().unwrap().push(f.into_string()));

        assert_eq!(decoder.feed(b"<alarm id='3'/><rep"), None);
        let verdict = decoder.feed(b"ly code='0'/><push/>");
        match verdict {
            Some(Verdict::Accept(Response::Markup(f))) => {
                assert_eq!(f.as_str(), "<reply code='0'/>");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(*seen.lock().unwrap(), ["<alarm id='3'/>", "<push/>"]);
    }

    #[test]
    fn test_markup_reply_reject_tag() {
        let mut decoder = MarkupReply::new("reply").reject_on("fault");
        let verdict = decoder.feed(b"<ns:fault xmlns:ns='urn:x' why='locked'/>");
        assert!(matches!(verdict, Some(Verdict::Reject(Response::Markup(_)))));
    }

    #[test]
    fn test_markup_unsolicited_keeps_partial_tail() {
        let mut decoder = MarkupReply::new("reply");
        decoder.unsolicited(b"<event>1</event><rep");
        assert_eq!(decoder.framer().buffered(), 4);
        assert!(decoder.feed(b"ly/>").is_some());
    }
}
