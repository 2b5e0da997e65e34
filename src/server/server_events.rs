use std::net::SocketAddr;

use crate::events::{LogStatus, StatusEvent};
use crate::protocol::message::MessageKind;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ServerEvent {
    ServerStarted,
    ServerStopped,
    ListenerStarted,
    ListenerStopped,
    ClientConnected { port: u16 },
    ClientDisconnected { port: u16 },
    /// Every message received on a session, including Ping and Disconnect
    TcpMessageReceived {
        from: SocketAddr,
        port: u16,
        kind: MessageKind,
        payload: String,
    },
    UdpMessageReceived {
        from: SocketAddr,
        payload: String,
    },
    LogStatus(LogStatus),
}

impl StatusEvent for ServerEvent {
    fn log_status(status: LogStatus) -> Self {
        ServerEvent::LogStatus(status)
    }
}
