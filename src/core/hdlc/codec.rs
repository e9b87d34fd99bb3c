//! Byte-stuffed frame codec
//!
//! Frames on the wire look like `7E <escaped body> <escaped FCS> 7E`.
//! Inside the body `7E` becomes `7D 5E` and `7D` becomes `7D 5D`.
//! Consecutive delimiters are inter-frame fill and yield nothing.

use super::fcs::{self, FCS_LEN};
use super::frame::{Control, ControlError, Frame};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Frame delimiter
pub const FLAG: u8 = 0x7E;

/// Escape octet
pub const ESCAPE: u8 = 0x7D;

/// Mask applied to escaped octets
pub const ESCAPE_MASK: u8 = 0x20;

/// Address, control and FCS octets around the information field
pub const FRAME_OVERHEAD: usize = 4;

/// Default upper bound on an unescaped frame body
pub const DEFAULT_MAX_FRAME_LEN: usize = 4096 + FRAME_OVERHEAD;

/// Why a run of bytes between delimiters was thrown away
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscardReason {
    /// No closing delimiter before the frame grew past the limit
    #[error("unterminated frame")]
    Unterminated,

    /// Escape followed by something other than an escaped delimiter or escape
    #[error("invalid escape sequence")]
    InvalidEscape,

    /// FCS residue mismatch
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// Shorter than address, control and FCS
    #[error("frame too short")]
    TooShort,

    /// Control octet outside the supported profile
    #[error("unsupported control field")]
    UnsupportedControl,
}

impl From<ControlError> for DiscardReason {
    fn from(_: ControlError) -> Self {
        Self::UnsupportedControl
    }
}

/// Outcome of one delimited run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    /// A frame with a valid FCS
    Frame {
        /// Decoded frame
        frame: Frame,
        /// Unescaped body including the FCS
        raw: Bytes,
    },
    /// A run that did not survive validation
    Discarded(DiscardReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    /// Waiting for an opening delimiter
    Hunt,
    /// Collecting body octets
    Body,
    /// Previous octet was an escape
    Escaped,
    /// Frame went bad, skipping to the next delimiter
    Skip(DiscardReason),
}

/// Streaming frame parser
///
/// Bytes may arrive in any chunking; complete frames are returned as soon
/// as their closing delimiter is seen.
#[derive(Debug)]
pub struct FrameParser {
    state: ParserState,
    buffer: BytesMut,
    max_frame_len: usize,
    with_address: bool,
}

impl FrameParser {
    /// Parser for frames that carry an address octet
    pub fn new() -> Self {
        Self::with_options(true, DEFAULT_MAX_FRAME_LEN)
    }

    /// Parser with explicit address presence and body limit
    pub fn with_options(with_address: bool, max_frame_len: usize) -> Self {
        Self {
            state: ParserState::Hunt,
            buffer: BytesMut::with_capacity(256),
            max_frame_len,
            with_address,
        }
    }

    /// Feed bytes, returning every frame or discard completed by them
    pub fn push(&mut self, data: &[u8]) -> Vec<ParseResult> {
        let mut results = Vec::new();
        for &byte in data {
            if let Some(result) = self.push_byte(byte) {
                results.push(result);
            }
        }
        results
    }

    fn push_byte(&mut self, byte: u8) -> Option<ParseResult> {
        match (self.state, byte) {
            (ParserState::Hunt, FLAG) => {
                self.start();
                None
            }
            (ParserState::Hunt, _) => None,
            (ParserState::Body, FLAG) => {
                let result = if self.buffer.is_empty() {
                    None
                } else {
                    Some(self.finish())
                };
                self.start();
                result
            }
            (ParserState::Body, ESCAPE) => {
                self.state = ParserState::Escaped;
                None
            }
            (ParserState::Body, _) => {
                self.append(byte);
                None
            }
            (ParserState::Escaped, FLAG) => {
                self.start();
                Some(ParseResult::Discarded(DiscardReason::InvalidEscape))
            }
            (ParserState::Escaped, _) => {
                let unescaped = byte ^ ESCAPE_MASK;
                if unescaped == FLAG || unescaped == ESCAPE {
                    self.state = ParserState::Body;
                    self.append(unescaped);
                } else {
                    self.state = ParserState::Skip(DiscardReason::InvalidEscape);
                    self.buffer.clear();
                }
                None
            }
            (ParserState::Skip(reason), FLAG) => {
                self.start();
                Some(ParseResult::Discarded(reason))
            }
            (ParserState::Skip(_), _) => None,
        }
    }

    fn start(&mut self) {
        self.buffer.clear();
        self.state = ParserState::Body;
    }

    fn append(&mut self, byte: u8) {
        if self.buffer.len() >= self.max_frame_len {
            self.buffer.clear();
            self.state = ParserState::Skip(DiscardReason::Unterminated);
        } else {
            self.buffer.put_u8(byte);
        }
    }

    fn finish(&mut self) -> ParseResult {
        let raw = self.buffer.split().freeze();
        match decode_body(&raw, self.with_address) {
            Ok(frame) => ParseResult::Frame { frame, raw },
            Err(reason) => ParseResult::Discarded(reason),
        }
    }

    /// Drop any partially collected frame
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = ParserState::Hunt;
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode an unescaped body that still ends in its FCS
pub fn decode_body(raw: &Bytes, with_address: bool) -> Result<Frame, DiscardReason> {
    let header_len = if with_address { 2 } else { 1 };
    if raw.len() < header_len + FCS_LEN {
        return Err(DiscardReason::TooShort);
    }
    if !fcs::verify(raw) {
        return Err(DiscardReason::ChecksumMismatch);
    }
    let address = with_address.then(|| raw[0]);
    let control = Control::from_octet(raw[header_len - 1])?;
    let payload = raw.slice(header_len..raw.len() - FCS_LEN);
    Ok(Frame {
        address,
        control,
        payload,
    })
}

/// Frame serializer
pub struct FrameGenerator;

impl FrameGenerator {
    /// Unescaped body: address, control, payload and FCS
    pub fn serialize(frame: &Frame) -> Bytes {
        let mut body = BytesMut::with_capacity(frame.payload.len() + 4);
        if let Some(address) = frame.address {
            body.put_u8(address);
        }
        body.put_u8(frame.control.to_octet());
        body.extend_from_slice(&frame.payload);
        let fcs = fcs::compute(&body);
        body.extend_from_slice(&fcs);
        body.freeze()
    }

    /// Append the delimited, escaped wire form of `frame` to `out`
    pub fn encode(frame: &Frame, out: &mut BytesMut) -> Bytes {
        let body = Self::serialize(frame);
        Self::escape(&body, out);
        body
    }

    /// Append `body` to `out` between delimiters with stuffing applied
    pub fn escape(body: &[u8], out: &mut BytesMut) {
        out.reserve(body.len() + body.len() / 8 + 2);
        out.put_u8(FLAG);
        for &byte in body {
            if byte == FLAG || byte == ESCAPE {
                out.put_u8(ESCAPE);
                out.put_u8(byte ^ ESCAPE_MASK);
            } else {
                out.put_u8(byte);
            }
        }
        out.put_u8(FLAG);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hdlc::frame::{SupervisoryKind, UnnumberedKind};

    fn wire(frame: &Frame) -> BytesMut {
        let mut out = BytesMut::new();
        FrameGenerator::encode(frame, &mut out);
        out
    }

    fn frames(results: Vec<ParseResult>) -> Vec<Frame> {
        results
            .into_iter()
            .filter_map(|result| match result {
                ParseResult::Frame { frame, .. } => Some(frame),
                ParseResult::Discarded(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_payload_with_reserved_octets() {
        let payload = Bytes::from_static(&[0x7E, 0x7D, 0x00, 0x7D, 0x5E, 0x7E, 0x7E]);
        let frame = Frame::information(Some(0x30), 3, 4, payload.clone());
        let encoded = wire(&frame);

        assert_eq!(encoded.iter().filter(|&&b| b == FLAG).count(), 2);

        let mut parser = FrameParser::new();
        let decoded = frames(parser.push(&encoded));
        assert_eq!(decoded, vec![frame]);
        assert_eq!(decoded[0].payload, payload);
    }

    #[test]
    fn test_every_octet_and_reserved_runs() {
        let mut payloads: Vec<Bytes> = (0..=u8::MAX).map(|octet| Bytes::from(vec![octet])).collect();
        for len in [2, 3, 16, 255] {
            payloads.push(Bytes::from(vec![FLAG; len]));
            payloads.push(Bytes::from(vec![ESCAPE; len]));
            payloads.push(Bytes::from([FLAG, ESCAPE].repeat(len)));
            payloads.push(Bytes::from([ESCAPE, FLAG ^ ESCAPE_MASK].repeat(len)));
        }

        let mut parser = FrameParser::new();
        for (seq, payload) in payloads.into_iter().enumerate() {
            let ns = (seq % 8) as u8;
            let frame = Frame::information(Some(0x30), ns, 7 - ns, payload);
            let encoded = wire(&frame);
            assert_eq!(encoded.first(), Some(&FLAG));
            assert_eq!(encoded.last(), Some(&FLAG));
            assert!(!encoded[1..encoded.len() - 1].contains(&FLAG));

            let decoded = frames(parser.push(&encoded));
            assert_eq!(decoded, vec![frame]);
        }
    }

    #[test]
    fn test_arbitrary_chunking() {
        let first = Frame::unnumbered(Some(0x30), UnnumberedKind::Sabm, true);
        let second = Frame::supervisory(Some(0x30), SupervisoryKind::ReceiveReady, 5, false);
        let mut stream = wire(&first);
        stream.extend_from_slice(&wire(&second));

        let mut parser = FrameParser::new();
        let mut decoded = Vec::new();
        for chunk in stream.chunks(3) {
            decoded.extend(frames(parser.push(chunk)));
        }
        assert_eq!(decoded, vec![first, second]);
    }

    #[test]
    fn test_garbage_before_first_flag() {
        let frame = Frame::ui(Some(0x30), Bytes::from_static(b"hello"));
        let mut stream = BytesMut::from(&[0x01, 0x02, 0x7D, 0x55][..]);
        stream.extend_from_slice(&wire(&frame));

        let mut parser = FrameParser::new();
        let results = parser.push(&stream);
        assert_eq!(results.len(), 1);
        assert_eq!(frames(results), vec![frame]);
    }

    #[test]
    fn test_checksum_mismatch() {
        let frame = Frame::ui(Some(0x30), Bytes::from_static(b"abc"));
        let mut encoded = wire(&frame);
        encoded[3] ^= 0x01;

        let mut parser = FrameParser::new();
        assert_eq!(
            parser.push(&encoded),
            vec![ParseResult::Discarded(DiscardReason::ChecksumMismatch)]
        );
    }

    #[test]
    fn test_invalid_escape() {
        let mut parser = FrameParser::new();
        assert_eq!(
            parser.push(&[FLAG, 0x30, 0x7D, 0x41, 0x00, 0x00, FLAG]),
            vec![ParseResult::Discarded(DiscardReason::InvalidEscape)]
        );
        assert_eq!(
            parser.push(&[0x30, 0x7D, FLAG]),
            vec![ParseResult::Discarded(DiscardReason::InvalidEscape)]
        );
    }

    #[test]
    fn test_recovers_after_bad_frame() {
        let good = Frame::unnumbered(Some(0x30), UnnumberedKind::Ua, true);
        let mut stream = BytesMut::from(&[FLAG, 0x30, 0x7D, 0x00, FLAG][..]);
        stream.extend_from_slice(&wire(&good));

        let mut parser = FrameParser::new();
        let results = parser.push(&stream);
        assert_eq!(results[0], ParseResult::Discarded(DiscardReason::InvalidEscape));
        assert_eq!(frames(results), vec![good]);
    }

    #[test]
    fn test_too_short_and_fill() {
        let mut parser = FrameParser::new();
        assert!(parser.push(&[FLAG, FLAG, FLAG]).is_empty());
        assert_eq!(
            parser.push(&[0x30, 0x3F, FLAG]),
            vec![ParseResult::Discarded(DiscardReason::TooShort)]
        );
    }

    #[test]
    fn test_unterminated() {
        let mut parser = FrameParser::with_options(true, 8);
        let mut stream = vec![FLAG];
        stream.extend(std::iter::repeat(0x11).take(20));
        assert!(parser.push(&stream).is_empty());
        assert_eq!(
            parser.push(&[FLAG]),
            vec![ParseResult::Discarded(DiscardReason::Unterminated)]
        );
    }

    #[test]
    fn test_unsupported_control() {
        let mut body = BytesMut::from(&[0x30, 0x0D][..]);
        let fcs = fcs::compute(&body);
        body.extend_from_slice(&fcs);
        let mut out = BytesMut::new();
        FrameGenerator::escape(&body, &mut out);

        let mut parser = FrameParser::new();
        assert_eq!(
            parser.push(&out),
            vec![ParseResult::Discarded(DiscardReason::UnsupportedControl)]
        );
    }

    #[test]
    fn test_without_address() {
        let frame = Frame::ui(None, Bytes::from_static(b"p2p"));
        let mut parser = FrameParser::with_options(false, DEFAULT_MAX_FRAME_LEN);
        assert_eq!(frames(parser.push(&wire(&frame))), vec![frame]);
    }
}
