use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

use crate::protocol::handoff::RedirectInstruction;
use crate::server::port_pool::{ReleaseOutcome, SlotLease};
use crate::server::server::{NetworkServer, ServerSessionHandler};
use crate::server::server_events::ServerEvent;
use crate::session::endpoint::SessionEndpoint;
use crate::session::receive_loop::run_receive_loop;

enum Waited {
    Accepted(std::io::Result<(TcpStream, SocketAddr)>),
    Released,
    HandshakeTimedOut,
}

impl NetworkServer {
    /// Accepts arrivals for as long as there are free slots. When the pool is exhausted, the
    ///  listening socket is closed, so further arrivals are refused by the OS until a disconnect
    ///  frees a slot.
    #[instrument(name = "rendezvous", skip_all, fields(generation = generation))]
    pub(super) async fn run_accept_loop(self: Arc<Self>, listener: TcpListener, generation: u64, mut stop: oneshot::Receiver<()>) {
        while self.pool.free_count() > 0 {
            // a stop request wins over arrivals that are already queued
            let accepted = select! {
                biased;
                _ = &mut stop => {
                    debug!("listener was stopped");
                    return;
                }
                result = listener.accept() => result,
            };

            match accepted {
                Ok((stream, arrival)) => self.hand_off(stream, arrival).await,
                Err(e) => {
                    self.events.log_error(format!("Rendezvous listener failed: {}", e));
                    break;
                }
            }
        }

        if self.pool.free_count() == 0 {
            self.events.log("All ports are in use.");
        }
        drop(listener);
        self.stop_listening_generation(generation).await;

        // a slot may have been freed while the listener was still marked as on
        if self.pool.free_count() > 0 {
            self.request_relisten();
        }
    }

    /// Reserves a slot for the arrival, opens the slot's dedicated listener, and only then tells the
    ///  arrival where to go - so the client's connect can never race ahead of the bind.
    async fn hand_off(self: &Arc<Self>, mut stream: TcpStream, arrival: SocketAddr) {
        let Some(lease) = self.pool.allocate() else {
            self.events.log(format!("Incoming connection from {:?}, but there is no free port - closing it.", arrival));
            return;
        };

        let dedicated = match TcpListener::bind(self.config.dedicated_addr(lease.port)).await {
            Ok(l) => l,
            Err(e) => {
                self.events.log_error(format!("Could not bind dedicated port {}: {}", lease.port, e));
                self.release_unconnected(lease);
                return;
            }
        };

        self.events.log(format!("Incoming connection from {:?}. Directing it to port {}.", arrival, lease.port));
        let redirect = RedirectInstruction {
            dedicated_port: lease.port,
            datagram_port: self.datagram_port.load(Ordering::Acquire),
        };
        let sent = async {
            stream.write_all(redirect.to_text().as_bytes()).await?;
            stream.shutdown().await
        };
        if let Err(e) = sent.await {
            self.events.log_error(format!("Could not send redirect to {:?}: {}", arrival, e));
            self.release_unconnected(lease);
            return;
        }
        drop(stream);

        tokio::spawn(self.clone().wait_for_dedicated_connection(lease, dedicated));
    }

    fn release_unconnected(&self, lease: SlotLease) {
        if let ReleaseOutcome::Released(_) = self.pool.release(lease) {
            debug!("released port {} before a session was established", lease.port);
        }
    }

    #[instrument(name = "dedicated_port", skip_all, fields(port = lease.port))]
    async fn wait_for_dedicated_connection(self: Arc<Self>, lease: SlotLease, listener: TcpListener) {
        let handshake_timeout = async {
            match self.config.handshake_timeout {
                Some(d) => sleep(d).await,
                None => std::future::pending().await,
            }
        };

        let waited = select! {
            result = listener.accept() => Waited::Accepted(result),
            _ = self.pool.wait_released(lease) => Waited::Released,
            _ = handshake_timeout => Waited::HandshakeTimedOut,
        };
        // the port must be unbound before the slot can be handed out again
        drop(listener);

        let stream = match waited {
            Waited::Accepted(Ok((stream, _))) => stream,
            Waited::Accepted(Err(e)) => {
                self.events.log_error(format!("Accepting on port {} failed: {}", lease.port, e));
                self.disconnect_slot(lease).await;
                return;
            }
            Waited::Released => {
                debug!("port {} was released while waiting for the client", lease.port);
                return;
            }
            Waited::HandshakeTimedOut => {
                self.events.log(format!("Client did not connect to port {} in time.", lease.port));
                self.disconnect_slot(lease).await;
                return;
            }
        };

        let (endpoint, reader) = match SessionEndpoint::from_tcp_stream(stream) {
            Ok(session) => session,
            Err(e) => {
                self.events.log_error(format!("Setting up the session on port {} failed: {}", lease.port, e));
                self.disconnect_slot(lease).await;
                return;
            }
        };

        if !self.pool.bind_session(lease, endpoint.clone()) {
            warn!("port {} was released while the client was connecting - closing the connection", lease.port);
            endpoint.close().await;
            return;
        }

        self.events.log(format!("Client is now connected on port {}.", lease.port));
        self.events.send_event(ServerEvent::ClientConnected { port: lease.port });

        let handler = Arc::new(ServerSessionHandler {
            server: self.clone(),
            lease,
            endpoint: endpoint.clone(),
        });
        tokio::spawn(run_receive_loop(reader, endpoint, self.config.receive_config(), handler));
    }
}
