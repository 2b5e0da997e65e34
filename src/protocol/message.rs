use std::fmt::{Debug, Display, Formatter};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::protocol::framing::FramingError;

/// The category of a message on the reliable channel. The numeric value is the stable code that
///  goes over the wire, so existing variants must never be renumbered.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageKind {
    /// Keep-alive traffic, sent by the protocol itself. Applications should not send these.
    Ping = 0,
    /// Announces that the sender is tearing down the session. Sent by the protocol itself.
    Disconnect = 1,
    /// Anything the application wants to say - the payload is opaque to the protocol.
    Application = 2,
}

impl MessageKind {
    pub fn code(self) -> u8 {
        self.into()
    }

    pub fn from_code(code: u8) -> Result<MessageKind, FramingError> {
        MessageKind::try_from(code)
            .map_err(|_| FramingError::UnknownMessageKind(code.to_string()))
    }
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Ping => write!(f, "Ping"),
            MessageKind::Disconnect => write!(f, "Disconnect"),
            MessageKind::Application => write!(f, "Application"),
        }
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct Message {
    pub kind: MessageKind,
    pub payload: String,
}

impl Message {
    pub fn new(kind: MessageKind, payload: impl Into<String>) -> Message {
        Message {
            kind,
            payload: payload.into(),
        }
    }

    pub fn ping() -> Message {
        Message::new(MessageKind::Ping, "Ping")
    }

    pub fn disconnect() -> Message {
        Message::new(MessageKind::Disconnect, "disconnect")
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}|{:?}]", self.kind, self.payload)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case(MessageKind::Ping, 0)]
    #[case(MessageKind::Disconnect, 1)]
    #[case(MessageKind::Application, 2)]
    fn test_kind_codes(#[case] kind: MessageKind, #[case] code: u8) {
        assert_eq!(kind.code(), code);
        assert_eq!(MessageKind::from_code(code).unwrap(), kind);
    }

    #[test]
    fn test_unknown_kind_code() {
        match MessageKind::from_code(3) {
            Err(FramingError::UnknownMessageKind(raw)) => assert_eq!(raw, "3"),
            other => panic!("expected unknown message kind, was {:?}", other),
        }
    }
}
