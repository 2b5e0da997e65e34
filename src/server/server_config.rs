use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use anyhow::bail;

use crate::session::receive_loop::ReceiveConfig;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: IpAddr,

    /// the single socket on which datagrams from all clients are received
    pub datagram_port: u16,
    /// the well-known port on which arrivals are redirected to their dedicated port
    pub rendezvous_port: u16,
    /// dedicated ports are `dedicated_port_base .. dedicated_port_base + max_connections`
    pub dedicated_port_base: u16,
    pub max_connections: u16,

    /// maximum silence on a session's reliable channel before the server drops it
    pub response_timeout: Duration,

    /// resume listening for arrivals when a disconnect frees a slot while the listener is off
    pub auto_relisten: bool,
    /// If set, a slot whose arrival does not connect to its dedicated port within this time is
    ///  released. If not set, such a slot stays occupied until the server is stopped.
    pub handshake_timeout: Option<Duration>,

    pub receive_buffer_size: usize,
}

impl ServerConfig {
    pub fn new(bind_address: IpAddr) -> ServerConfig {
        ServerConfig {
            bind_address,
            datagram_port: 29970,
            rendezvous_port: 29971,
            dedicated_port_base: 29972,
            max_connections: 2,
            response_timeout: Duration::from_secs(20),
            auto_relisten: true,
            handshake_timeout: None,
            receive_buffer_size: 512,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_connections == 0 {
            bail!("at least one connection must be allowed");
        }
        if self.dedicated_port_base.checked_add(self.max_connections - 1).is_none() {
            bail!("dedicated port range {}+{} exceeds the port number space", self.dedicated_port_base, self.max_connections);
        }
        if self.dedicated_ports().contains(&self.rendezvous_port) {
            bail!("rendezvous port {} is inside the dedicated port range", self.rendezvous_port);
        }
        if self.dedicated_ports().contains(&self.datagram_port) {
            bail!("datagram port {} is inside the dedicated port range", self.datagram_port);
        }
        if self.response_timeout.is_zero() {
            bail!("response timeout must be positive");
        }
        if self.receive_buffer_size == 0 {
            bail!("receive buffer size must be positive");
        }
        Ok(())
    }

    pub fn dedicated_ports(&self) -> std::ops::RangeInclusive<u16> {
        let last = self.dedicated_port_base.saturating_add(self.max_connections.saturating_sub(1));
        self.dedicated_port_base..=last
    }

    pub fn rendezvous_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.rendezvous_port)
    }

    pub fn datagram_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.datagram_port)
    }

    pub fn dedicated_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.bind_address, port)
    }

    pub fn receive_config(&self) -> ReceiveConfig {
        ReceiveConfig {
            response_timeout: self.response_timeout,
            buffer_size: self.receive_buffer_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use rstest::rstest;
    use super::*;

    fn config() -> ServerConfig {
        ServerConfig::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[test]
    fn test_defaults() {
        let config = config();
        assert_eq!(config.datagram_port, 29970);
        assert_eq!(config.rendezvous_port, 29971);
        assert_eq!(config.dedicated_ports(), 29972..=29973);
        assert_eq!(config.response_timeout, Duration::from_secs(20));
        assert!(config.auto_relisten);
        assert!(config.handshake_timeout.is_none());
        config.validate().unwrap();
    }

    #[rstest]
    #[case::no_capacity(0, 30000, 29971, 29970)]
    #[case::range_overflow(10, 65530, 29971, 29970)]
    #[case::rendezvous_in_range(5, 29970, 29972, 29969)]
    #[case::datagram_in_range(5, 29972, 29971, 29976)]
    fn test_validate_rejects(#[case] max_connections: u16, #[case] base: u16, #[case] rendezvous: u16, #[case] datagram: u16) {
        let mut config = config();
        config.max_connections = max_connections;
        config.dedicated_port_base = base;
        config.rendezvous_port = rendezvous;
        config.datagram_port = datagram;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_range_up_to_last_port() {
        let mut config = config();
        config.dedicated_port_base = 65530;
        config.max_connections = 6;
        config.validate().unwrap();
        assert_eq!(config.dedicated_ports(), 65530..=65535);
    }
}
