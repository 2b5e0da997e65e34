use std::net::SocketAddr;

use crate::events::{LogStatus, StatusEvent};
use crate::protocol::message::MessageKind;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ClientEvent {
    ConnectStarted,
    Connected,
    ConnectFailed,
    Disconnected,
    /// Every message received from the server, including Ping and Disconnect
    MessageReceived {
        from: SocketAddr,
        kind: MessageKind,
        payload: String,
    },
    LogStatus(LogStatus),
}

impl StatusEvent for ClientEvent {
    fn log_status(status: LogStatus) -> Self {
        ClientEvent::LogStatus(status)
    }
}
