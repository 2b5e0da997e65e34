use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::select;
use tokio::time::sleep;
use tracing::{debug, instrument, trace};

use crate::protocol::framing::{decode, is_readable_buffer, FrameAccumulator, FramingError};
use crate::protocol::message::Message;
use crate::session::endpoint::SessionEndpoint;

/// The three ways a receive loop can end on its own, plus the local close (explicit API call,
///  or a Disconnect message from the peer that the handler acted on). All of them lead to the
///  same idempotent teardown.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DisconnectReason {
    /// nothing arrived within the liveness timeout
    Timeout,
    /// the read returned nothing but zero bytes
    PeerClosed,
    TransportFault(String),
    LocallyClosed,
}

impl Display for DisconnectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::Timeout => write!(f, "read timeout"),
            DisconnectReason::PeerClosed => write!(f, "peer closed the connection"),
            DisconnectReason::TransportFault(msg) => write!(f, "transport fault: {}", msg),
            DisconnectReason::LocallyClosed => write!(f, "closed locally"),
        }
    }
}

/// This trait decouples the receive loop (identical for both sides) from what each side does
///  with a received message and with the end of a session.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn on_message(&self, message: Message);

    /// A complete fragment was extracted but could not be decoded. The loop keeps running.
    fn on_protocol_fault(&self, fragment: &str, error: &FramingError);

    /// Called exactly once per receive loop, after the loop has stopped reading
    async fn on_session_ended(&self, reason: DisconnectReason);
}

#[derive(Clone, Copy, Debug)]
pub struct ReceiveConfig {
    /// maximum silence on the reliable channel before the session is considered dead
    pub response_timeout: Duration,
    pub buffer_size: usize,
}

/// Reads from the session's stream until it times out, fails, turns up an unreadable buffer, or
///  the endpoint is closed. Complete messages are handed to `handler` in the order they arrived.
///
/// Each read races against a fresh timer; whichever loses is dropped on the spot.
#[instrument(name = "receive_loop", skip_all, fields(peer = ?endpoint.peer_addr()))]
pub async fn run_receive_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    endpoint: Arc<SessionEndpoint>,
    config: ReceiveConfig,
    handler: Arc<dyn SessionHandler>,
) -> DisconnectReason {
    debug!("starting receive loop");

    let mut buf = vec![0u8; config.buffer_size];
    let mut accumulator = FrameAccumulator::new();
    let mut closed = endpoint.closed_signal();

    let reason = loop {
        if !endpoint.is_connected() {
            break DisconnectReason::LocallyClosed;
        }

        buf.fill(0);
        let read_result = select! {
            result = reader.read(&mut buf) => result,
            _ = sleep(config.response_timeout) => break DisconnectReason::Timeout,
            _ = closed.wait_for(|&c| c) => break DisconnectReason::LocallyClosed,
        };

        let num_read = match read_result {
            Ok(n) => n,
            Err(e) => break DisconnectReason::TransportFault(e.to_string()),
        };
        if !is_readable_buffer(&buf) {
            break DisconnectReason::PeerClosed;
        }

        trace!("received {} bytes", num_read);
        accumulator.push(&buf[..num_read]);
        while let Some(fragment) = accumulator.extract_next() {
            match decode(&fragment) {
                Ok(message) => handler.on_message(message).await,
                Err(e) => handler.on_protocol_fault(&fragment, &e),
            }
        }
        if accumulator.pending_len() > 0 {
            trace!("{} bytes of an incomplete message pending", accumulator.pending_len());
        }
    };

    debug!("receive loop terminated: {}", reason);
    handler.on_session_ended(reason.clone()).await;
    reason
}
