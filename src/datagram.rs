//! The unreliable side channel: raw ASCII payloads, one datagram per send, no framing and no
//!  acknowledgement. The server binds a single receiving socket for all clients; each client
//!  gets a connected sending socket once its session is established.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::watch;
use tracing::{debug, info, trace};

use crate::util::ascii::{ascii_bytes, ascii_text};

pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

pub struct DatagramSender {
    socket: UdpSocket,
}

impl DatagramSender {
    pub async fn connect(server_addr: SocketAddr) -> std::io::Result<DatagramSender> {
        let bind_addr = if server_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(server_addr).await?;
        debug!("datagram socket {:?} connected to {:?}", socket.local_addr()?, server_addr);
        Ok(DatagramSender { socket })
    }

    pub async fn send(&self, payload: &str) -> std::io::Result<()> {
        let buf = ascii_bytes(payload);
        self.socket.send(&buf).await?;
        trace!("sent datagram of {} bytes", buf.len());
        Ok(())
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// Receives datagrams until `running` turns `false` (returning `Ok`) or the socket fails
///  (returning the error). Every datagram is passed to `on_datagram` as ASCII text.
pub async fn run_datagram_receive_loop(
    socket: Arc<UdpSocket>,
    mut running: watch::Receiver<bool>,
    on_datagram: impl Fn(SocketAddr, String) + Send,
) -> anyhow::Result<()> {
    info!("receiving datagrams on {:?}", socket.local_addr()?);

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (num_read, from) = select! {
            result = socket.recv_from(&mut buf) => result?,
            _ = running.wait_for(|&r| !r) => {
                debug!("datagram receive loop shutting down");
                return Ok(());
            }
        };

        trace!("received datagram of {} bytes from {:?}", num_read, from);
        on_datagram(from, ascii_text(&buf[..num_read]));
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use super::*;

    #[tokio::test]
    async fn test_send_and_receive() {
        let receive_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let server_addr = receive_socket.local_addr().unwrap();
        let (running_send, running) = watch::channel(true);
        let (send, mut recv) = mpsc::unbounded_channel();

        let receive_loop = tokio::spawn(run_datagram_receive_loop(receive_socket, running, move |from, text| {
            let _ = send.send((from, text));
        }));

        let sender = DatagramSender::connect(server_addr).await.unwrap();
        sender.send("hello over udp").await.unwrap();

        let (from, text) = recv.recv().await.unwrap();
        assert_eq!(text, "hello over udp");
        assert_eq!(from.port(), sender.local_addr().unwrap().port());

        running_send.send_replace(false);
        receive_loop.await.unwrap().unwrap();
    }
}
