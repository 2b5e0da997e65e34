use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::protocol::framing::{check_payload, encode, FramingError};
use crate::protocol::message::{Message, MessageKind};

/// Upper bound for the courtesy Disconnect message and the shutdown on teardown - the peer may
///  be gone or stalled
const DISCONNECT_SEND_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("transport fault: {0}")]
    Transport(#[from] std::io::Error),
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The sending half of an established session, and the authority on whether the session is still
///  connected. The receiving half is owned by the session's receive loop (see
///  [crate::session::receive_loop]), which watches [SessionEndpoint::closed_signal] so that
///  closing the endpoint terminates it.
///
/// A closed endpoint stays closed - the next occupant of a port slot gets a new endpoint.
pub struct SessionEndpoint {
    peer_addr: SocketAddr,
    writer: Mutex<Option<BoxedWriter>>,
    closed: watch::Sender<bool>,
}

impl Debug for SessionEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionEndpoint{{peer:{:?}, connected:{}}}", self.peer_addr, self.is_connected())
    }
}

impl SessionEndpoint {
    pub fn new(peer_addr: SocketAddr, writer: impl AsyncWrite + Send + Unpin + 'static) -> SessionEndpoint {
        let (closed, _) = watch::channel(false);
        SessionEndpoint {
            peer_addr,
            writer: Mutex::new(Some(Box::new(writer))),
            closed,
        }
    }

    pub fn from_tcp_stream(stream: TcpStream) -> std::io::Result<(Arc<SessionEndpoint>, OwnedReadHalf)> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok((Arc::new(SessionEndpoint::new(peer_addr, write_half)), read_half))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_connected(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Resolves (i.e. the watched value becomes `true`) once the endpoint is closed
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Sends an application level message. This is a no-op if the session is not connected
    ///  (any more); a transport fault on an open session is reported to the caller.
    pub async fn send(&self, kind: MessageKind, payload: &str) -> Result<(), SendError> {
        check_payload(payload)?;
        self.send_message(&Message::new(kind, payload)).await
    }

    /// A send that is still blocked on a peer that stopped reading gives up (returning `Ok`) as soon
    ///  as the endpoint is closed, so it never holds the writer past [SessionEndpoint::close].
    pub async fn send_message(&self, message: &Message) -> Result<(), SendError> {
        let mut closed = self.closed.subscribe();
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            trace!("not connected - skipping {:?}", message);
            return Ok(());
        };

        let frame = encode(message.kind, &message.payload);
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        select! {
            result = written => result?,
            _ = closed.wait_for(|&c| c) => {
                debug!("session to {:?} was closed while sending {:?}", self.peer_addr, message);
                return Ok(());
            }
        }
        trace!("sent {:?} to {:?}", message, self.peer_addr);
        Ok(())
    }

    /// Tears the session down: the endpoint is marked as closed, then a best effort Disconnect
    ///  message goes to the peer and the socket is shut down.
    ///
    /// Returns `true` for the call that actually closed the endpoint, `false` for every call after
    ///  that.
    pub async fn close(&self) -> bool {
        if !self.closed.send_if_modified(|closed| !std::mem::replace(closed, true)) {
            return false;
        }

        // a pending send releases the writer once it sees the closed flag
        let writer = self.writer.lock().await.take();
        let Some(mut writer) = writer else {
            return true;
        };

        let disconnect = Message::disconnect();
        let courtesy = async {
            writer.write_all(&encode(disconnect.kind, &disconnect.payload)).await?;
            writer.flush().await
        };
        match timeout(DISCONNECT_SEND_TIMEOUT, courtesy).await {
            Ok(Ok(())) => trace!("sent disconnect message to {:?}", self.peer_addr),
            Ok(Err(e)) => debug!("could not send disconnect message to {:?}, ignoring: {}", self.peer_addr, e),
            Err(_) => debug!("timed out sending disconnect message to {:?}, ignoring", self.peer_addr),
        }
        if timeout(DISCONNECT_SEND_TIMEOUT, writer.shutdown()).await.is_err() {
            debug!("timed out shutting down the connection to {:?}", self.peer_addr);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt};
    use tokio::time::sleep;
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[tokio::test]
    async fn test_send_writes_frame() {
        let (near, mut far) = duplex(256);
        let endpoint = SessionEndpoint::new(peer(), near);

        endpoint.send(MessageKind::Application, "hello").await.unwrap();

        let mut buf = [0u8; 10];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x022|hello|\x03");
    }

    #[tokio::test]
    async fn test_send_rejects_reserved_characters() {
        let (near, _far) = duplex(256);
        let endpoint = SessionEndpoint::new(peer(), near);

        match endpoint.send(MessageKind::Application, "a|b").await {
            Err(SendError::Framing(FramingError::ReservedCharacter(_))) => {}
            other => panic!("expected reserved character error, was {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (near, mut far) = duplex(256);
        let endpoint = SessionEndpoint::new(peer(), near);
        let mut closed = endpoint.closed_signal();

        assert!(endpoint.is_connected());
        assert!(endpoint.close().await);
        assert!(!endpoint.is_connected());
        assert!(!endpoint.close().await);
        assert!(*closed.wait_for(|&c| c).await.unwrap());

        let mut received = Vec::new();
        far.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"\x021|disconnect|\x03".to_vec());
    }

    #[tokio::test]
    async fn test_close_with_vanished_peer() {
        let (near, far) = duplex(256);
        drop(far);
        let endpoint = SessionEndpoint::new(peer(), near);

        assert!(endpoint.close().await);
        assert!(!endpoint.is_connected());
    }

    #[tokio::test]
    async fn test_send_after_close_is_noop() {
        let (near, _far) = duplex(256);
        let endpoint = SessionEndpoint::new(peer(), near);
        endpoint.close().await;

        endpoint.send(MessageKind::Application, "late").await.unwrap();
    }

    #[tokio::test]
    async fn test_send_to_vanished_peer_fails() {
        let (near, far) = duplex(256);
        drop(far);
        let endpoint = SessionEndpoint::new(peer(), near);

        match endpoint.send(MessageKind::Application, "x").await {
            Err(SendError::Transport(_)) => {}
            other => panic!("expected transport fault, was {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_does_not_wait_for_stalled_send() {
        // the far side never reads, and the pipe holds far less than the message
        let (near, _far) = duplex(16);
        let endpoint = Arc::new(SessionEndpoint::new(peer(), near));

        let stalled = tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.send(MessageKind::Application, &"x".repeat(1000)).await }
        });
        sleep(Duration::from_millis(10)).await;
        assert!(!stalled.is_finished());

        let closed = timeout(Duration::from_secs(3), endpoint.close()).await;
        assert_eq!(closed.ok(), Some(true));
        assert!(!endpoint.is_connected());

        stalled.await.unwrap().unwrap();
        endpoint.send(MessageKind::Application, "late").await.unwrap();
    }
}
