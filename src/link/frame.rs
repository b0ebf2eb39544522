//! Frame encoding and decoding for the ARQ link layer.
//!
//! The wire format is a reference layout for a classic stop-and-wait link:
//! ```text
//! ┌────────┬─────────┬────────┬─────────────┬──────────────┐
//! │  kind  │ control │  len   │   payload   │ CRC-16 (LE)  │
//! │ 1 byte │ 1 byte  │ 1 byte │  len bytes  │   2 bytes    │
//! └────────┴─────────┴────────┴─────────────┴──────────────┘
//! ```
//! `len` and `payload` are present only for Data and Error frames. The
//! control byte packs `seq` (bits 0-2), `retransmitted` (bit 3), `ack_seq`
//! (bits 4-6) and `not_ready` (bit 7). The checksum is CRC-16/KERMIT over all
//! preceding bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{CRC_16_KERMIT, Crc};

use crate::error::FrameError;

/// Maximum payload carried by one Data or Error frame.
pub const MAX_PAYLOAD: usize = u8::MAX as usize;

/// Sequence numbers count modulo this value.
pub const SEQUENCE_MODULUS: u8 = 8;

const SEQUENCE_MASK: u8 = 0x07;
const RETRANSMITTED_BIT: u8 = 0x08;
const ACK_SHIFT: u8 = 4;
const NOT_READY_BIT: u8 = 0x80;
const CHECKSUM_LEN: usize = 2;

const CHECKSUM: Crc<u16> = Crc::<u16>::new(&CRC_16_KERMIT);

/// Returns the sequence number following `seq`.
#[must_use]
pub const fn next_sequence(seq: u8) -> u8 {
    seq.wrapping_add(1) & SEQUENCE_MASK
}

/// Link-layer frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Carries a payload and must be acknowledged.
    Data = 0x44,
    /// Positive acknowledgment of `ack_sequence`.
    Ack = 0x41,
    /// Negative acknowledgment; the peer should retransmit.
    Nak = 0x4E,
    /// Peer-side failure; the payload's first byte is the error code.
    Error = 0x45,
}

impl FrameKind {
    /// Attempts to parse a frame kind from its discriminator byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x44 => Some(Self::Data),
            0x41 => Some(Self::Ack),
            0x4E => Some(Self::Nak),
            0x45 => Some(Self::Error),
            _ => None,
        }
    }

    /// Returns true if frames of this kind carry a length byte and payload.
    #[must_use]
    pub const fn carries_payload(self) -> bool {
        matches!(self, Self::Data | Self::Error)
    }

    const fn label(self) -> &'static str {
        match self {
            Self::Data => "Data",
            Self::Ack => "Ack",
            Self::Nak => "Nak",
            Self::Error => "Error",
        }
    }
}

/// One link-layer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Frame {
    pub kind: FrameKind,
    pub sequence: u8,
    pub ack_sequence: u8,
    pub retransmitted: bool,
    pub not_ready: bool,
    pub payload: Bytes,
    /// Set by the decoder; always true for locally built frames.
    pub checksum_valid: bool,
}

impl Frame {
    fn new(kind: FrameKind, sequence: u8, ack_sequence: u8, payload: Bytes) -> Self {
        Self {
            kind,
            sequence: sequence & SEQUENCE_MASK,
            ack_sequence: ack_sequence & SEQUENCE_MASK,
            retransmitted: false,
            not_ready: false,
            payload,
            checksum_valid: true,
        }
    }

    /// Builds a Data frame.
    #[must_use]
    pub fn data(sequence: u8, ack_sequence: u8, payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Data, sequence, ack_sequence, payload.into())
    }

    /// Builds an Ack for the peer's frame `ack_sequence`.
    #[must_use]
    pub fn ack(sequence: u8, ack_sequence: u8) -> Self {
        Self::new(FrameKind::Ack, sequence, ack_sequence, Bytes::new())
    }

    /// Builds a Nak asking the peer to resend.
    #[must_use]
    pub fn nak(sequence: u8, ack_sequence: u8) -> Self {
        Self::new(FrameKind::Nak, sequence, ack_sequence, Bytes::new())
    }

    /// Builds an Error frame carrying `code`.
    #[must_use]
    pub fn error(sequence: u8, ack_sequence: u8, code: u8) -> Self {
        Self::new(FrameKind::Error, sequence, ack_sequence, Bytes::copy_from_slice(&[code]))
    }

    /// Marks the frame as a retransmission.
    #[must_use]
    pub fn retransmission(mut self) -> Self {
        self.retransmitted = true;
        self
    }

    /// Sets the not-ready flag.
    #[must_use]
    pub fn with_not_ready(mut self, not_ready: bool) -> Self {
        self.not_ready = not_ready;
        self
    }

    /// Returns the error code of an Error frame.
    #[must_use]
    pub fn error_code(&self) -> Option<u8> {
        match self.kind {
            FrameKind::Error => Some(self.payload.first().copied().unwrap_or(0)),
            _ => None,
        }
    }

    fn control(&self) -> u8 {
        let mut control = self.sequence & SEQUENCE_MASK;
        control |= (self.ack_sequence & SEQUENCE_MASK) << ACK_SHIFT;
        if self.retransmitted {
            control |= RETRANSMITTED_BIT;
        }
        if self.not_ready {
            control |= NOT_READY_BIT;
        }
        control
    }

    /// Encodes the frame for the wire.
    ///
    /// # Errors
    ///
    /// Fails if the payload is too large or the kind carries no payload.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let carries = self.kind.carries_payload();
        if !carries && !self.payload.is_empty() {
            return Err(FrameError::UnexpectedPayload {
                kind: self.kind.label(),
            });
        }
        if self.payload.len() > MAX_PAYLOAD {
            return Err(FrameError::TooLarge {
                size: self.payload.len(),
                max: MAX_PAYLOAD,
            });
        }

        let mut buf = BytesMut::with_capacity(3 + self.payload.len() + CHECKSUM_LEN);
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.control());
        if carries {
            buf.put_u8(self.payload.len() as u8);
            buf.put_slice(&self.payload);
        }
        let checksum = CHECKSUM.checksum(&buf);
        buf.put_u16_le(checksum);
        Ok(buf.freeze())
    }
}

/// Frame decoder that handles partial data and line noise.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Creates a new frame decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds data into the decoder.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next complete frame.
    ///
    /// Bytes that cannot start a frame are skipped. A frame whose checksum
    /// does not match is still returned, with `checksum_valid` cleared, so
    /// the link can answer it with a Nak.
    pub fn decode(&mut self) -> Option<Frame> {
        loop {
            let &first = self.buffer.first()?;
            let Some(kind) = FrameKind::from_byte(first) else {
                self.buffer.advance(1);
                continue;
            };

            let header_len = if kind.carries_payload() { 3 } else { 2 };
            if self.buffer.len() < header_len {
                return None;
            }
            let payload_len = if kind.carries_payload() {
                self.buffer[2] as usize
            } else {
                0
            };
            let total = header_len + payload_len + CHECKSUM_LEN;
            if self.buffer.len() < total {
                return None;
            }

            let raw = self.buffer.split_to(total);
            let body = &raw[..total - CHECKSUM_LEN];
            let expected = u16::from_le_bytes([raw[total - 2], raw[total - 1]]);
            let control = raw[1];

            return Some(Frame {
                kind,
                sequence: control & SEQUENCE_MASK,
                ack_sequence: (control >> ACK_SHIFT) & SEQUENCE_MASK,
                retransmitted: control & RETRANSMITTED_BIT != 0,
                not_ready: control & NOT_READY_BIT != 0,
                payload: Bytes::copy_from_slice(&raw[header_len..header_len + payload_len]),
                checksum_valid: CHECKSUM.checksum(body) == expected,
            });
        }
    }

    /// Returns the number of bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_byte_packing() {
        let frame = Frame::data(3, 5, Bytes::from_static(b"x"))
            .retransmission()
            .with_not_ready(true);
        let wire = frame.encode().unwrap();

        assert_eq!(wire[0], b'D');
        assert_eq!(wire[1], 0x03 | 0x08 | (5 << 4) | 0x80);
        assert_eq!(wire[2], 1);
        assert_eq!(wire[3], b'x');
        assert_eq!(wire.len(), 6);
    }

    #[test]
    fn test_ack_has_no_length_byte() {
        let wire = Frame::ack(0, 6).encode().unwrap();
        assert_eq!(wire.len(), 4);
        assert_eq!(wire[0], b'A');
        assert_eq!(wire[1], 6 << 4);
    }

    #[test]
    fn test_decode_complete_frame() {
        let frame = Frame::data(2, 1, Bytes::from_static(b"<ok/>"));
        let mut decoder = FrameDecoder::new();
        decoder.feed(&frame.encode().unwrap());

        let decoded = decoder.decode().unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decode_partial_frame() {
        let wire = Frame::data(4, 0, Bytes::from_static(b"hello")).encode().unwrap();
        let mut decoder = FrameDecoder::new();

        decoder.feed(&wire[..4]);
        assert!(decoder.decode().is_none());

        decoder.feed(&wire[4..]);
        let decoded = decoder.decode().unwrap();
        assert_eq!(&decoded.payload[..], b"hello");
        assert_eq!(decoded.sequence, 4);
    }

    #[test]
    fn test_decode_skips_noise() {
        let wire = Frame::nak(1, 2).encode().unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[0x00, 0xFF, 0x13]);
        decoder.feed(&wire);

        let decoded = decoder.decode().unwrap();
        assert_eq!(decoded.kind, FrameKind::Nak);
        assert_eq!(decoded.ack_sequence, 2);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decode_flags_bad_checksum() {
        let mut wire = Frame::data(0, 0, Bytes::from_static(b"abc"))
            .encode()
            .unwrap()
            .to_vec();
        wire[4] ^= 0xFF;

        let mut decoder = FrameDecoder::new();
        decoder.feed(&wire);
        let decoded = decoder.decode().unwrap();
        assert!(!decoded.checksum_valid);
        assert_eq!(decoded.kind, FrameKind::Data);
    }

    #[test]
    fn test_decode_multiple_frames() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&Frame::ack(0, 3).encode().unwrap());
        decoder.feed(&Frame::error(0, 0, 0x42).encode().unwrap());

        assert_eq!(decoder.decode().unwrap().kind, FrameKind::Ack);
        let error = decoder.decode().unwrap();
        assert_eq!(error.error_code(), Some(0x42));
        assert!(decoder.decode().is_none());
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let frame = Frame::data(0, 0, vec![0u8; MAX_PAYLOAD + 1]);
        assert!(matches!(frame.encode(), Err(FrameError::TooLarge { .. })));
    }

    #[test]
    fn test_encode_rejects_payload_on_ack() {
        let mut frame = Frame::ack(0, 0);
        frame.payload = Bytes::from_static(b"x");
        assert!(matches!(
            frame.encode(),
            Err(FrameError::UnexpectedPayload { kind: "Ack" })
        ));
    }

    #[test]
    fn test_sequence_wraps() {
        assert_eq!(next_sequence(6), 7);
        assert_eq!(next_sequence(7), 0);
    }
}
