//! Wire format of the reliable channel:
//!
//! ```ascii
//! 0x02 <kind code, decimal> '|' <payload> '|' 0x03
//! ```
//!
//! Several messages may arrive in a single read, and a single message may be split across
//!  reads. The receiving side appends everything it reads to an accumulator and pulls complete
//!  fragments out of it with [extract_next] until there are none left.
//!
//! Payloads must not contain '|', 0x02 or 0x03 - there is no escaping.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::warn;

use crate::protocol::message::{Message, MessageKind};
use crate::util::ascii::{ascii_bytes, ascii_text};

pub const START_DELIMITER: char = '\u{2}';
pub const END_DELIMITER: char = '\u{3}';
pub const FIELD_SEPARATOR: char = '|';

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("unknown message kind {0:?}")]
    UnknownMessageKind(String),
    #[error("malformed message fragment {0:?}")]
    MalformedFragment(String),
    #[error("payload contains a reserved framing character: {0:?}")]
    ReservedCharacter(String),
    #[error("malformed redirect instruction {0:?}")]
    MalformedRedirect(String),
}

pub fn encode(kind: MessageKind, payload: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 8);
    buf.put_u8(START_DELIMITER as u8);
    buf.put_slice(kind.code().to_string().as_bytes());
    buf.put_u8(FIELD_SEPARATOR as u8);
    buf.put_slice(&ascii_bytes(payload));
    buf.put_u8(FIELD_SEPARATOR as u8);
    buf.put_u8(END_DELIMITER as u8);
    buf.freeze()
}

pub fn check_payload(payload: &str) -> Result<(), FramingError> {
    if payload.contains(&[START_DELIMITER, END_DELIMITER, FIELD_SEPARATOR][..]) {
        return Err(FramingError::ReservedCharacter(payload.to_string()));
    }
    Ok(())
}

/// Decodes the text between a start and an end delimiter.
pub fn decode(fragment: &str) -> Result<Message, FramingError> {
    let mut fields = fragment.split(FIELD_SEPARATOR);

    let code_field = fields.next().unwrap_or_default().trim();
    let code: i64 = code_field.parse()
        .map_err(|_| FramingError::MalformedFragment(fragment.to_string()))?;
    let kind = u8::try_from(code).ok()
        .and_then(|code| MessageKind::from_code(code).ok())
        .ok_or_else(|| FramingError::UnknownMessageKind(code_field.to_string()))?;

    let payload = fields.next()
        .ok_or_else(|| FramingError::MalformedFragment(fragment.to_string()))?;

    Ok(Message::new(kind, payload))
}

/// Decodes a raw receive buffer directly, without going through an accumulator. This only works
///  if the buffer holds exactly one message; a leading start delimiter is tolerated.
///
/// This is a standalone helper for peers that send one message per write and read one message
///  per buffer. The session receive loops never use it; they go through [FrameAccumulator], which
///  handles coalesced and split messages.
pub fn decode_buffer(buffer: &[u8], bytes_read: usize) -> Result<Message, FramingError> {
    let text = ascii_text(&buffer[..bytes_read.min(buffer.len())]);
    decode(text.trim_start_matches(START_DELIMITER))
}

/// Pulls the next complete fragment out of `accumulator`, removing it and everything before it.
///
/// The first end delimiter and the first start delimiter are located independently. If the first
///  end delimiter comes *before* the first start delimiter, it is a stray with no message to
///  close, and it is discarded together with whatever precedes it.
pub fn extract_next(accumulator: &mut String) -> Option<String> {
    loop {
        let end = accumulator.find(END_DELIMITER)?;
        let start = accumulator.find(START_DELIMITER)?;

        if start > end {
            warn!("discarding {} bytes up to an end delimiter without a preceding start delimiter", end + 1);
            accumulator.drain(..=end);
            continue;
        }

        let fragment = accumulator[start + 1..end].to_string();
        accumulator.drain(..=end);
        return Some(fragment);
    }
}

/// The receive buffer is considered to hold real content iff there is at least one non-zero byte
///  *anywhere* in it, regardless of how many bytes the last read returned. Callers must zero the
///  buffer before each read for this to be meaningful.
pub fn is_readable_buffer(buffer: &[u8]) -> bool {
    buffer.iter().any(|&b| b != 0)
}

/// Receive-side text accumulator for a single session. It lives exactly as long as the session's
///  receive loop.
#[derive(Default)]
pub struct FrameAccumulator {
    pending: String,
}

impl FrameAccumulator {
    pub fn new() -> FrameAccumulator {
        Default::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.push_str(&ascii_text(bytes));
    }

    pub fn extract_next(&mut self) -> Option<String> {
        extract_next(&mut self.pending)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_encode() {
        assert_eq!(encode(MessageKind::Application, "hello").as_ref(), b"\x022|hello|\x03");
        assert_eq!(encode(MessageKind::Ping, "Ping").as_ref(), b"\x020|Ping|\x03");
        assert_eq!(encode(MessageKind::Disconnect, "").as_ref(), b"\x021||\x03");
    }

    #[rstest]
    #[case(MessageKind::Ping, "Ping")]
    #[case(MessageKind::Disconnect, "disconnect")]
    #[case(MessageKind::Application, "hello world")]
    #[case(MessageKind::Application, "")]
    fn test_round_trip(#[case] kind: MessageKind, #[case] payload: &str) {
        let mut acc = FrameAccumulator::new();
        acc.push(&encode(kind, payload));
        let fragment = acc.extract_next().unwrap();
        assert_eq!(decode(&fragment).unwrap(), Message::new(kind, payload));
        assert!(acc.extract_next().is_none());
    }

    #[rstest]
    #[case::unknown_code("7|x|", true)]
    #[case::negative_code("-1|x|", true)]
    #[case::huge_code("300|x|", true)]
    #[case::not_a_number("abc|x|", false)]
    #[case::empty("", false)]
    #[case::missing_payload("2", false)]
    fn test_decode_failures(#[case] fragment: &str, #[case] expect_unknown_kind: bool) {
        match decode(fragment) {
            Err(FramingError::UnknownMessageKind(_)) => assert!(expect_unknown_kind),
            Err(FramingError::MalformedFragment(_)) => assert!(!expect_unknown_kind),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_decode_buffer() {
        let mut buffer = [0u8; 32];
        let encoded = encode(MessageKind::Application, "abc");
        buffer[..encoded.len()].copy_from_slice(&encoded);

        assert_eq!(decode_buffer(&buffer, encoded.len()).unwrap(), Message::new(MessageKind::Application, "abc"));

        let plain = b"0|Ping|";
        assert_eq!(decode_buffer(plain, plain.len()).unwrap(), Message::ping());
    }

    #[rstest]
    #[case::ok("abc", true)]
    #[case::empty("", true)]
    #[case::separator("a|b", false)]
    #[case::start("a\u{2}b", false)]
    #[case::end("a\u{3}", false)]
    fn test_check_payload(#[case] payload: &str, #[case] expected_ok: bool) {
        assert_eq!(check_payload(payload).is_ok(), expected_ok);
    }

    #[test]
    fn test_extract_incomplete() {
        let mut acc = "\u{2}2|hel".to_string();
        assert_eq!(extract_next(&mut acc), None);
        assert_eq!(acc, "\u{2}2|hel");

        acc.push_str("lo|\u{3}\u{2}0|P");
        assert_eq!(extract_next(&mut acc), Some("2|hello|".to_string()));
        assert_eq!(acc, "\u{2}0|P");
        assert_eq!(extract_next(&mut acc), None);
    }

    #[test]
    fn test_extract_discards_prefix_before_start() {
        let mut acc = "garbage\u{2}2|x|\u{3}tail".to_string();
        assert_eq!(extract_next(&mut acc), Some("2|x|".to_string()));
        assert_eq!(acc, "tail");
    }

    #[test]
    fn test_extract_end_without_any_start_is_kept() {
        let mut acc = "abc\u{3}".to_string();
        assert_eq!(extract_next(&mut acc), None);
        assert_eq!(acc, "abc\u{3}");
    }

    #[test]
    fn test_extract_skips_stray_end() {
        let mut acc = "abc\u{3}\u{2}2|x|\u{3}".to_string();
        assert_eq!(extract_next(&mut acc), Some("2|x|".to_string()));
        assert!(acc.is_empty());
    }

    #[test]
    fn test_extract_batched() {
        let mut acc = FrameAccumulator::new();
        acc.push(&encode(MessageKind::Ping, "Ping"));
        acc.push(&encode(MessageKind::Application, "a"));
        acc.push(&encode(MessageKind::Disconnect, "disconnect"));

        let mut decoded = Vec::new();
        while let Some(fragment) = acc.extract_next() {
            decoded.push(decode(&fragment).unwrap());
        }
        assert_eq!(decoded, vec![
            Message::ping(),
            Message::new(MessageKind::Application, "a"),
            Message::disconnect(),
        ]);
        assert_eq!(acc.pending_len(), 0);
    }

    fn sample_stream() -> (Vec<u8>, Vec<Message>) {
        let messages = vec![
            Message::new(MessageKind::Application, "first"),
            Message::ping(),
            Message::new(MessageKind::Application, ""),
            Message::new(MessageKind::Application, "a somewhat longer payload"),
            Message::disconnect(),
        ];
        let mut bytes = Vec::new();
        for m in &messages {
            bytes.extend_from_slice(&encode(m.kind, &m.payload));
        }
        (bytes, messages)
    }

    fn feed_in_chunks(bytes: &[u8], split_points: &[usize]) -> Vec<Message> {
        let mut acc = FrameAccumulator::new();
        let mut result = Vec::new();
        let mut prev = 0;
        for &split in split_points.iter().chain(std::iter::once(&bytes.len())) {
            acc.push(&bytes[prev..split]);
            prev = split;
            while let Some(fragment) = acc.extract_next() {
                result.push(decode(&fragment).unwrap());
            }
        }
        result
    }

    #[test]
    fn test_fragmentation_any_single_split() {
        let (bytes, messages) = sample_stream();
        for split in 0..=bytes.len() {
            assert_eq!(feed_in_chunks(&bytes, &[split]), messages, "split at {}", split);
        }
    }

    #[test]
    fn test_fragmentation_byte_by_byte() {
        let (bytes, messages) = sample_stream();
        let split_points = (1..bytes.len()).collect::<Vec<_>>();
        assert_eq!(feed_in_chunks(&bytes, &split_points), messages);
    }

    #[rstest]
    #[case::all_zero(&[0, 0, 0, 0], false)]
    #[case::empty(&[], false)]
    #[case::last_byte(&[0, 0, 0, 1], true)]
    #[case::first_byte(&[2, 0, 0, 0], true)]
    fn test_is_readable_buffer(#[case] buffer: &[u8], #[case] expected: bool) {
        assert_eq!(is_readable_buffer(buffer), expected);
    }
}
