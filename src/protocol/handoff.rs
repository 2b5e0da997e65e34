use std::fmt::{Display, Formatter};

use crate::protocol::framing::FramingError;

const REDIRECT_PREFIX: &str = "Connect to this port";

/// The plain text instruction that the rendezvous listener sends to each arrival before closing
///  the connection: where to open the dedicated session connection, and where the server
///  receives datagrams. It is *not* delimiter framed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RedirectInstruction {
    pub dedicated_port: u16,
    pub datagram_port: u16,
}

impl RedirectInstruction {
    pub fn to_text(&self) -> String {
        self.to_string()
    }

    /// Trailing NUL bytes (from a partially filled fixed size buffer) and whitespace are ignored.
    pub fn parse(text: &str) -> Result<RedirectInstruction, FramingError> {
        let malformed = || FramingError::MalformedRedirect(text.to_string());

        let text = text.trim_end_matches(|c: char| c == '\0' || c.is_whitespace());
        let mut fields = text.split(':');

        if fields.next() != Some(REDIRECT_PREFIX) {
            return Err(malformed());
        }
        let dedicated_port = fields.next()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(malformed)?;
        let datagram_port = fields.next()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(malformed)?;

        Ok(RedirectInstruction {
            dedicated_port,
            datagram_port,
        })
    }
}

impl Display for RedirectInstruction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", REDIRECT_PREFIX, self.dedicated_port, self.datagram_port)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_to_text() {
        let redirect = RedirectInstruction { dedicated_port: 29972, datagram_port: 29970 };
        assert_eq!(redirect.to_text(), "Connect to this port:29972:29970");
    }

    #[rstest]
    #[case::plain("Connect to this port:29973:29970", Some((29973, 29970)))]
    #[case::nul_padded("Connect to this port:1:2\0\0\0\0", Some((1, 2)))]
    #[case::wrong_prefix("Go away:1:2", None)]
    #[case::missing_datagram_port("Connect to this port:1", None)]
    #[case::not_a_port("Connect to this port:x:2", None)]
    #[case::port_out_of_range("Connect to this port:70000:2", None)]
    #[case::empty("", None)]
    fn test_parse(#[case] text: &str, #[case] expected: Option<(u16, u16)>) {
        let parsed = RedirectInstruction::parse(text).ok()
            .map(|r| (r.dedicated_port, r.datagram_port));
        assert_eq!(parsed, expected);
    }
}
