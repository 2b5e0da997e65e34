use clap::Parser;
use clap_derive::{Parser, Subcommand};
use rendezvous_net::client::client::NetworkClient;
use rendezvous_net::client::client_config::ClientConfig;
use rendezvous_net::client::client_events::ClientEvent;
use rendezvous_net::protocol::message::MessageKind;
use rendezvous_net::server::server::NetworkServer;
use rendezvous_net::server::server_config::ServerConfig;
use rendezvous_net::server::server_events::ServerEvent;
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, Level};

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    mode: Mode,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[derive(Subcommand)]
enum Mode {
    /// Runs a server. Console input: STOP, START, EXIT - anything else is broadcast to all clients.
    Server {
        #[clap(long, default_value = "0.0.0.0")]
        bind_address: IpAddr,
        #[clap(long, default_value_t = 29971)]
        rendezvous_port: u16,
        #[clap(long, default_value_t = 2)]
        max_connections: u16,
        #[clap(long, default_value_t = 20)]
        timeout_seconds: u64,
    },
    /// Connects to a server. Console input: EXIT, 'UDP <text>' sends a datagram - anything else is
    ///  sent as an application message.
    Client {
        server_address: IpAddr,
        #[clap(long, default_value_t = 29971)]
        rendezvous_port: u16,
    },
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    match args.mode {
        Mode::Server { bind_address, rendezvous_port, max_connections, timeout_seconds } => {
            let mut config = ServerConfig::new(bind_address);
            config.rendezvous_port = rendezvous_port;
            config.max_connections = max_connections;
            config.response_timeout = Duration::from_secs(timeout_seconds);
            run_server(config).await
        }
        Mode::Client { server_address, rendezvous_port } => {
            run_client(server_address, rendezvous_port).await
        }
    }
}

async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    let server = NetworkServer::new(config)?;
    tokio::spawn(print_events(server.subscribe(), |event| match event {
        ServerEvent::TcpMessageReceived { port, kind: MessageKind::Application, payload, .. } => {
            info!("port {}: {}", port, payload)
        }
        ServerEvent::UdpMessageReceived { from, payload } => info!("datagram from {:?}: {}", from, payload),
        _ => {}
    }));

    server.start().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "STOP" => server.stop().await,
            "START" => if let Err(e) = server.start().await {
                error!("could not start server: {}", e);
            },
            "EXIT" => break,
            text => if let Err(e) = server.broadcast(MessageKind::Application, text).await {
                error!("broadcast failed: {}", e);
            },
        }
    }

    server.stop().await;
    Ok(())
}

async fn run_client(server_address: IpAddr, rendezvous_port: u16) -> anyhow::Result<()> {
    let client = NetworkClient::new(ClientConfig::default());
    tokio::spawn(print_events(client.subscribe(), |event| match event {
        ClientEvent::MessageReceived { kind: MessageKind::Application, payload, .. } => info!("server: {}", payload),
        ClientEvent::Disconnected => info!("disconnected - type EXIT to quit"),
        _ => {}
    }));

    client.connect(server_address, rendezvous_port).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let result = if line == "EXIT" {
            break;
        }
        else if let Some(datagram) = line.strip_prefix("UDP ") {
            client.send_udp(datagram).await
        }
        else {
            client.send_tcp(MessageKind::Application, line).await
        };

        if let Err(e) = result {
            error!("sending failed: {}", e);
        }
    }

    client.disconnect().await;
    Ok(())
}

async fn print_events<E: Clone>(mut events: broadcast::Receiver<E>, print: impl Fn(E)) {
    loop {
        match events.recv().await {
            Ok(event) => print(event),
            Err(RecvError::Lagged(n)) => error!("missed {} events", n),
            Err(RecvError::Closed) => break,
        }
    }
}
