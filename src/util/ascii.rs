//! Text on both channels is plain ASCII. Anything outside the 7-bit range is replaced by `?`,
//!  in both directions, so a peer never sees a multi-byte sequence.

pub const REPLACEMENT: u8 = b'?';

pub fn ascii_text(bytes: &[u8]) -> String {
    bytes.iter()
        .map(|&b| if b.is_ascii() { b as char } else { REPLACEMENT as char })
        .collect()
}

pub fn ascii_bytes(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| if c.is_ascii() { c as u8 } else { REPLACEMENT })
        .collect()
}
