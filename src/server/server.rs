use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, oneshot, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace};

use crate::datagram::run_datagram_receive_loop;
use crate::events::EventNotifier;
use crate::protocol::framing::{check_payload, FramingError};
use crate::protocol::message::{Message, MessageKind};
use crate::server::port_pool::{PortPool, PortSlotInfo, ReleaseOutcome, SlotLease};
use crate::server::server_config::ServerConfig;
use crate::server::server_events::ServerEvent;
use crate::session::endpoint::{SendError, SessionEndpoint};
use crate::session::receive_loop::{DisconnectReason, SessionHandler};

pub(super) struct ListenerHandle {
    pub(super) generation: u64,
    pub(super) stop: oneshot::Sender<()>,
    /// the accept loop, which owns the rendezvous socket
    pub(super) task: JoinHandle<()>,
}

/// The server side of the protocol: a rendezvous listener that hands each arrival a dedicated
///  port from a fixed pool, one session per occupied port, and a single datagram socket.
///
/// All operations may be called concurrently from any task. Lifecycle operations (start / stop)
///  are serialized; everything else relies on the port pool's atomic slot transitions.
pub struct NetworkServer {
    pub(super) config: Arc<ServerConfig>,
    pub(super) events: EventNotifier<ServerEvent>,
    pub(super) pool: PortPool,

    pub(super) running: watch::Sender<bool>,
    pub(super) listener: Mutex<Option<ListenerHandle>>,
    pub(super) listening: AtomicBool,
    pub(super) listener_generation: AtomicU64,
    /// the datagram port as actually bound, which is what the redirect text announces
    pub(super) datagram_port: AtomicU16,

    relisten: Notify,
    relisten_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    datagram_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    lifecycle: Mutex<()>,
}

impl NetworkServer {
    pub fn new(config: ServerConfig) -> anyhow::Result<Arc<NetworkServer>> {
        config.validate()?;

        let pool = PortPool::new(config.dedicated_port_base, config.max_connections)?;
        let (running, _) = watch::channel(false);
        let datagram_port = AtomicU16::new(config.datagram_port);

        Ok(Arc::new(NetworkServer {
            config: Arc::new(config),
            events: EventNotifier::new(),
            pool,
            running,
            listener: Mutex::new(None),
            listening: AtomicBool::new(false),
            listener_generation: AtomicU64::new(0),
            datagram_port,
            relisten: Notify::new(),
            relisten_task: std::sync::Mutex::new(None),
            datagram_task: std::sync::Mutex::new(None),
            lifecycle: Mutex::new(()),
        }))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub fn ports(&self) -> Vec<PortSlotInfo> {
        self.pool.snapshot()
    }

    pub fn free_slot_count(&self) -> usize {
        self.pool.free_count()
    }

    pub fn datagram_port(&self) -> u16 {
        self.datagram_port.load(Ordering::Acquire)
    }

    /// Binds the datagram socket, starts the rendezvous listener and the datagram receive loop.
    ///  Starting a running server is a no-op.
    #[instrument(name = "start_server", skip_all)]
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            self.events.log("Server is already running.");
            return Ok(());
        }

        let datagram_socket = match UdpSocket::bind(self.config.datagram_addr()).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                self.events.log_error(format!("Could not bind datagram socket to {:?}: {}", self.config.datagram_addr(), e));
                return Err(e.into());
            }
        };
        self.datagram_port.store(datagram_socket.local_addr()?.port(), Ordering::Release);

        self.running.send_replace(true);
        if let Err(e) = self.start_listening_for_connections().await {
            self.running.send_replace(false);
            return Err(e);
        }

        let server = self.clone();
        let running = self.running.subscribe();
        let datagram_task = tokio::spawn(async move {
            let result = run_datagram_receive_loop(datagram_socket, running, |from, payload| {
                server.events.send_event(ServerEvent::UdpMessageReceived { from, payload });
            }).await;
            match result {
                Ok(()) => server.events.log("Datagram socket closed."),
                Err(e) => server.events.log_error(format!("Datagram socket failed: {}", e)),
            }
        });
        *self.datagram_task.lock().unwrap() = Some(datagram_task);

        let relisten_task = tokio::spawn(self.clone().run_relisten_loop());
        if let Some(previous) = self.relisten_task.lock().unwrap().replace(relisten_task) {
            previous.abort();
        }

        self.events.log("Server successfully started.");
        self.events.send_event(ServerEvent::ServerStarted);
        Ok(())
    }

    /// Stops listening, closes the datagram socket and disconnects every occupied port. When this
    ///  returns, the rendezvous and datagram ports are unbound, so the server can be started again
    ///  right away.
    #[instrument(name = "stop_server", skip_all)]
    pub async fn stop(self: &Arc<Self>) {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.is_running() {
            self.events.log("Server is not running.");
            return;
        }

        self.running.send_replace(false);
        let relisten_task = self.relisten_task.lock().unwrap().take();
        if let Some(relisten_task) = relisten_task {
            relisten_task.abort();
            let _ = relisten_task.await;
        }
        self.stop_listening().await;

        // the datagram loop drops its socket when it sees `running` turn false
        let datagram_task = self.datagram_task.lock().unwrap().take();
        if let Some(datagram_task) = datagram_task {
            if let Err(e) = datagram_task.await {
                debug!("datagram receive loop did not terminate cleanly: {}", e);
            }
        }

        for lease in self.pool.occupied() {
            self.disconnect_slot(lease).await;
        }

        self.events.log("Server stopped.");
        self.events.send_event(ServerEvent::ServerStopped);
    }

    /// Starts accepting arrivals on the rendezvous port. This is a no-op if the listener is
    ///  already on, the server is not running, or there is no free slot to hand out.
    pub async fn start_listening_for_connections(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut listener_state = self.listener.lock().await;
        if listener_state.is_some() {
            self.events.log("Listener is already listening.");
            return Ok(());
        }
        if !self.is_running() {
            self.events.log("Server is not running - not listening.");
            return Ok(());
        }
        if self.pool.free_count() == 0 {
            self.events.log("No free ports - not listening.");
            return Ok(());
        }

        let listener = match tokio::net::TcpListener::bind(self.config.rendezvous_addr()).await {
            Ok(l) => l,
            Err(e) => {
                self.events.log_error(format!("Could not bind rendezvous listener to {:?}: {}", self.config.rendezvous_addr(), e));
                return Err(e.into());
            }
        };

        let generation = self.listener_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (stop, stop_receiver) = oneshot::channel();
        // the accept loop can not stop itself before `listener_state` is released
        let task = tokio::spawn(self.clone().run_accept_loop(listener, generation, stop_receiver));
        *listener_state = Some(ListenerHandle { generation, stop, task });
        self.listening.store(true, Ordering::Release);

        self.events.log(format!("Listening for incoming connections on {:?}.", self.config.rendezvous_addr()));
        self.events.send_event(ServerEvent::ListenerStarted);
        Ok(())
    }

    /// Stops accepting arrivals. When this returns, the rendezvous port is unbound and no further
    ///  arrival is redirected. This is a no-op if the listener is off.
    pub async fn stop_listening(&self) {
        let handle = self.listener.lock().await.take();
        if let Some(handle) = handle {
            let accept_loop = self.on_listener_stopped(handle);
            if let Err(e) = accept_loop.await {
                debug!("accept loop did not terminate cleanly: {}", e);
            }
        }
    }

    /// Stops the listener only if it is still the one identified by `generation`, i.e. an accept
    ///  loop that ended on its own does not stop a listener that was started after it.
    pub(super) async fn stop_listening_generation(&self, generation: u64) {
        let mut listener_state = self.listener.lock().await;
        if listener_state.as_ref().map(|h| h.generation) != Some(generation) {
            return;
        }
        if let Some(handle) = listener_state.take() {
            // called from the accept loop itself, so its task handle is not awaited
            drop(self.on_listener_stopped(handle));
        }
    }

    fn on_listener_stopped(&self, handle: ListenerHandle) -> JoinHandle<()> {
        let _ = handle.stop.send(());
        self.listening.store(false, Ordering::Release);
        self.events.log("Listener for incoming connections stopped.");
        self.events.send_event(ServerEvent::ListenerStopped);
        handle.task
    }

    /// Disconnects the session on `port`. This is a no-op if the port is not in use.
    pub async fn disconnect_port(self: &Arc<Self>, port: u16) {
        match self.pool.lease_for_port(port) {
            Some(lease) => self.disconnect_slot(lease).await,
            None => debug!("port {} is not in use - nothing to disconnect", port),
        }
    }

    /// The single teardown path for a slot: whoever releases the lease first does the work, every
    ///  other caller (receive loop ending, explicit disconnect, server stop) returns immediately.
    pub(super) async fn disconnect_slot(&self, lease: SlotLease) {
        let session = match self.pool.release(lease) {
            ReleaseOutcome::AlreadyFree => {
                trace!("port {} was already released", lease.port);
                return;
            }
            ReleaseOutcome::Released(session) => session,
        };

        if let Some(endpoint) = session {
            endpoint.close().await;
        }

        self.events.log(format!("Port {} disconnected.", lease.port));
        self.events.send_event(ServerEvent::ClientDisconnected { port: lease.port });

        self.request_relisten();
    }

    pub(super) fn request_relisten(&self) {
        if self.config.auto_relisten && self.is_running() && !self.is_listening() {
            self.relisten.notify_one();
        }
    }

    async fn run_relisten_loop(self: Arc<Self>) {
        loop {
            self.relisten.notified().await;

            if self.is_running() && !self.is_listening() && self.pool.free_count() > 0 {
                self.events.log("Server listener auto started.");
                if let Err(e) = self.start_listening_for_connections().await {
                    debug!("auto restarting the listener failed: {}", e);
                }
            }
        }
    }

    /// Sends a message to the session on `port`. This is a no-op if there is no session on the
    ///  port.
    pub async fn send_message(&self, port: u16, kind: MessageKind, payload: &str) -> Result<(), SendError> {
        match self.pool.session_for_port(port) {
            Some(endpoint) => endpoint.send(kind, payload).await,
            None => {
                debug!("no session on port {} - not sending", port);
                Ok(())
            }
        }
    }

    /// Sends a message to every established session. All sessions are attempted; if any of the
    ///  sends failed, the last failure is returned.
    pub async fn broadcast(&self, kind: MessageKind, payload: &str) -> Result<(), SendError> {
        check_payload(payload)?;

        let mut result = Ok(());
        for (port, endpoint) in self.pool.sessions() {
            if let Err(e) = endpoint.send(kind, payload).await {
                self.events.log_error(format!("Broadcast to port {} failed: {}", port, e));
                result = Err(e);
            }
        }
        result
    }
}

/// What the server does with the messages of a session on one dedicated port
pub(super) struct ServerSessionHandler {
    pub(super) server: Arc<NetworkServer>,
    pub(super) lease: SlotLease,
    pub(super) endpoint: Arc<SessionEndpoint>,
}

#[async_trait]
impl SessionHandler for ServerSessionHandler {
    async fn on_message(&self, message: Message) {
        match message.kind {
            MessageKind::Ping => {
                trace!("ping from port {} - echoing it", self.lease.port);
                if let Err(e) = self.endpoint.send_message(&Message::ping()).await {
                    debug!("echoing ping to port {} failed: {}", self.lease.port, e);
                }
            }
            MessageKind::Disconnect => {
                self.server.events.log(format!("Client on port {} sent disconnect.", self.lease.port));
                self.server.disconnect_slot(self.lease).await;
            }
            MessageKind::Application => {}
        }

        self.server.events.send_event(ServerEvent::TcpMessageReceived {
            from: self.endpoint.peer_addr(),
            port: self.lease.port,
            kind: message.kind,
            payload: message.payload,
        });
    }

    fn on_protocol_fault(&self, fragment: &str, error: &FramingError) {
        self.server.events.log_error(format!("Undecodable message from port {}: {} ({:?})", self.lease.port, error, fragment));
    }

    async fn on_session_ended(&self, reason: DisconnectReason) {
        match &reason {
            DisconnectReason::Timeout => self.server.events.log(format!("Timeout from port {}.", self.lease.port)),
            DisconnectReason::PeerClosed => self.server.events.log(format!("Client on port {} closed the connection.", self.lease.port)),
            DisconnectReason::TransportFault(msg) => self.server.events.log_error(format!("Connection on port {} failed: {}", self.lease.port, msg)),
            DisconnectReason::LocallyClosed => {}
        }
        self.server.disconnect_slot(self.lease).await;
    }
}
