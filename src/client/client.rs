use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{broadcast, watch};
use tokio::time::sleep;
use tracing::{debug, instrument, trace};

use crate::client::client_config::ClientConfig;
use crate::client::client_events::ClientEvent;
use crate::datagram::DatagramSender;
use crate::events::EventNotifier;
use crate::protocol::framing::FramingError;
use crate::protocol::handoff::RedirectInstruction;
use crate::protocol::message::{Message, MessageKind};
use crate::session::endpoint::{SendError, SessionEndpoint};
use crate::session::ping::run_ping_loop;
use crate::session::receive_loop::{run_receive_loop, DisconnectReason, SessionHandler};
use crate::util::ascii::ascii_text;
use crate::util::retry::Backoff;

/// upper bound for the redirect text - it is a few dozen bytes in practice
const REDIRECT_MAX_LEN: u64 = 512;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("client is already connected")]
    AlreadyConnected,
    #[error("a connect is already in progress")]
    ConnectInProgress,
    #[error("connect was cancelled")]
    Cancelled,
    #[error("could not reach the rendezvous listener at {addr:?} in {attempts} attempts: {source}")]
    RendezvousUnreachable {
        addr: SocketAddr,
        attempts: u32,
        #[source] source: std::io::Error,
    },
    #[error("could not read the redirect from the rendezvous listener: {0}")]
    RedirectRead(#[source] std::io::Error),
    #[error("invalid redirect from the rendezvous listener: {0}")]
    Handshake(#[from] FramingError),
    #[error("could not connect to dedicated port {port}: {source}")]
    DedicatedConnection {
        port: u16,
        #[source] source: std::io::Error,
    },
    #[error("could not set up the datagram channel: {0}")]
    DatagramSetup(#[source] std::io::Error),
}

struct ClientSession {
    endpoint: Arc<SessionEndpoint>,
    datagram: DatagramSender,
}

/// Everything that is established by the handshake, but not yet live
struct Established {
    endpoint: Arc<SessionEndpoint>,
    reader: OwnedReadHalf,
    datagram: DatagramSender,
}

/// The client side of the protocol: connects through the server's rendezvous port, then holds a
///  session on its dedicated port, keeping it alive with pings and dropping it when the server
///  falls silent for longer than the response timeout.
///
/// A client holds at most one session at a time, and can reconnect after it was disconnected.
pub struct NetworkClient {
    config: ClientConfig,
    events: EventNotifier<ClientEvent>,
    connecting: AtomicBool,
    session: RwLock<Option<Arc<ClientSession>>>,
    cancel: watch::Sender<u64>,
}

impl NetworkClient {
    pub fn new(config: ClientConfig) -> Arc<NetworkClient> {
        let (cancel, _) = watch::channel(0);
        Arc::new(NetworkClient {
            config,
            events: EventNotifier::new(),
            connecting: AtomicBool::new(false),
            session: RwLock::new(None),
            cancel,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.current_session()
            .is_some_and(|s| s.endpoint.is_connected())
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::Acquire)
    }

    /// the server's address on the dedicated port, if connected
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.current_session()
            .map(|s| s.endpoint.peer_addr())
    }

    fn current_session(&self) -> Option<Arc<ClientSession>> {
        self.session.read().unwrap().clone()
    }

    /// Connects to a server through its rendezvous port, retrying if the port is unreachable.
    ///  Resolves when the session is established or the attempt has definitely failed; 'connected'
    ///  or 'failed' is notified accordingly.
    #[instrument(name = "connect", skip_all, fields(server = ?server_ip, rendezvous_port = rendezvous_port))]
    pub async fn connect(self: &Arc<Self>, server_ip: IpAddr, rendezvous_port: u16) -> Result<(), ConnectError> {
        if self.is_connected() {
            self.events.log("Client already connected. Connection aborted.");
            return Err(ConnectError::AlreadyConnected);
        }

        let mut cancelled = self.cancel.subscribe();
        if self.connecting.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            debug!("connect is already in progress");
            return Err(ConnectError::ConnectInProgress);
        }
        self.events.send_event(ClientEvent::ConnectStarted);

        let result = select! {
            result = self.establish(server_ip, rendezvous_port) => result,
            _ = cancelled.changed() => Err(ConnectError::Cancelled),
        };

        match result {
            Ok(established) => {
                self.go_live(established);
                Ok(())
            }
            Err(e) => {
                self.connecting.store(false, Ordering::Release);
                self.events.log_error(format!("Client could not connect: {}", e));
                self.events.send_event(ClientEvent::ConnectFailed);
                Err(e)
            }
        }
    }

    /// Aborts a connect that is in progress, which then fails with [ConnectError::Cancelled]. This
    ///  is a no-op if no connect is in progress.
    pub fn cancel_connect(&self) {
        if self.is_connecting() {
            self.cancel.send_modify(|generation| *generation += 1);
        }
    }

    async fn establish(&self, server_ip: IpAddr, rendezvous_port: u16) -> Result<Established, ConnectError> {
        let mut rendezvous = self.connect_to_rendezvous(SocketAddr::new(server_ip, rendezvous_port)).await?;
        self.events.log("Client connected to listener.");

        let mut buf = Vec::new();
        (&mut rendezvous).take(REDIRECT_MAX_LEN)
            .read_to_end(&mut buf).await
            .map_err(ConnectError::RedirectRead)?;
        drop(rendezvous);

        let redirect = RedirectInstruction::parse(&ascii_text(&buf))?;
        debug!("redirected to {}", redirect);

        let dedicated_addr = SocketAddr::new(server_ip, redirect.dedicated_port);
        let (endpoint, reader) = TcpStream::connect(dedicated_addr).await
            .and_then(SessionEndpoint::from_tcp_stream)
            .map_err(|source| ConnectError::DedicatedConnection { port: redirect.dedicated_port, source })?;

        let datagram = match DatagramSender::connect(SocketAddr::new(server_ip, redirect.datagram_port)).await {
            Ok(datagram) => datagram,
            Err(e) => {
                endpoint.close().await;
                return Err(ConnectError::DatagramSetup(e));
            }
        };

        self.events.log(format!("Client connected to {:?}.", dedicated_addr));
        Ok(Established {
            endpoint,
            reader,
            datagram,
        })
    }

    async fn connect_to_rendezvous(&self, addr: SocketAddr) -> Result<TcpStream, ConnectError> {
        let mut backoff = Backoff::new(&self.config.retry);
        loop {
            self.events.log(format!("Client trying to connect to listener (attempt {} of {})...", backoff.failed_attempts() + 1, self.config.connect_attempts()));
            let e = match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => e,
            };

            self.events.log_error(format!("Could not reach the listener at {:?}: {}", addr, e));
            match backoff.next_delay() {
                Some(delay) => sleep(delay).await,
                None => return Err(ConnectError::RendezvousUnreachable {
                    addr,
                    attempts: backoff.failed_attempts(),
                    source: e,
                }),
            }
        }
    }

    fn go_live(self: &Arc<Self>, established: Established) {
        let Established { endpoint, reader, datagram } = established;

        let session = Arc::new(ClientSession {
            endpoint: endpoint.clone(),
            datagram,
        });
        *self.session.write().unwrap() = Some(session.clone());
        self.connecting.store(false, Ordering::Release);
        self.events.send_event(ClientEvent::Connected);

        tokio::spawn(run_ping_loop(endpoint.clone(), self.config.ping_interval));
        let handler = Arc::new(ClientSessionHandler {
            client: self.clone(),
            session,
        });
        tokio::spawn(run_receive_loop(reader, endpoint, self.config.receive_config(), handler));
    }

    /// Closes the session, notifying 'disconnected' exactly once. This is a no-op if the client
    ///  is not connected.
    pub async fn disconnect(&self) {
        let session = self.session.write().unwrap().take();
        match session {
            Some(session) => self.tear_down(session).await,
            None => debug!("not connected - nothing to disconnect"),
        }
    }

    /// Disconnects only if `session` is still the current one, so a receive loop that ends late
    ///  can not affect a newer session.
    async fn disconnect_session(&self, session: &Arc<ClientSession>) {
        let current = {
            let mut guard = self.session.write().unwrap();
            if guard.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
                guard.take()
            }
            else {
                None
            }
        };
        if let Some(current) = current {
            self.tear_down(current).await;
        }
    }

    async fn tear_down(&self, session: Arc<ClientSession>) {
        session.endpoint.close().await;
        self.events.log("Client disconnected.");
        self.events.send_event(ClientEvent::Disconnected);
    }

    /// Sends a message on the reliable channel. This is a no-op if the client is not connected.
    pub async fn send_tcp(&self, kind: MessageKind, payload: &str) -> Result<(), SendError> {
        match self.current_session() {
            Some(session) => session.endpoint.send(kind, payload).await,
            None => {
                debug!("not connected - not sending");
                Ok(())
            }
        }
    }

    /// Sends a single datagram to the server. This is a no-op if the client is not connected.
    pub async fn send_udp(&self, payload: &str) -> Result<(), SendError> {
        match self.current_session() {
            Some(session) => Ok(session.datagram.send(payload).await?),
            None => {
                debug!("not connected - not sending datagram");
                Ok(())
            }
        }
    }
}

struct ClientSessionHandler {
    client: Arc<NetworkClient>,
    session: Arc<ClientSession>,
}

#[async_trait]
impl SessionHandler for ClientSessionHandler {
    async fn on_message(&self, message: Message) {
        match message.kind {
            MessageKind::Ping => trace!("pinged by server"),
            MessageKind::Disconnect => {
                self.client.events.log("Server sent disconnect.");
                self.client.disconnect_session(&self.session).await;
            }
            MessageKind::Application => {}
        }

        self.client.events.send_event(ClientEvent::MessageReceived {
            from: self.session.endpoint.peer_addr(),
            kind: message.kind,
            payload: message.payload,
        });
    }

    fn on_protocol_fault(&self, fragment: &str, error: &FramingError) {
        self.client.events.log_error(format!("Undecodable message from server: {} ({:?})", error, fragment));
    }

    async fn on_session_ended(&self, reason: DisconnectReason) {
        match &reason {
            DisconnectReason::Timeout => self.client.events.log("Server timed out."),
            DisconnectReason::PeerClosed => self.client.events.log("Server closed the connection."),
            DisconnectReason::TransportFault(msg) => self.client.events.log_error(format!("Connection to server failed: {}", msg)),
            DisconnectReason::LocallyClosed => {}
        }
        self.client.disconnect_session(&self.session).await;
    }
}
