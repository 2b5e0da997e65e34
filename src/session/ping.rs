use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

use crate::protocol::message::Message;
use crate::session::endpoint::SessionEndpoint;

/// Sends a Ping every `interval` (the first one after one interval) for as long as the endpoint
///  is connected. A failing send ends the loop; the receive loop notices the broken connection on
///  its own.
#[instrument(name = "ping_loop", skip_all, fields(peer = ?endpoint.peer_addr()))]
pub async fn run_ping_loop(endpoint: Arc<SessionEndpoint>, interval: Duration) {
    let mut closed = endpoint.closed_signal();

    loop {
        select! {
            _ = sleep(interval) => {}
            _ = closed.wait_for(|&c| c) => break,
        }
        if !endpoint.is_connected() {
            break;
        }

        if let Err(e) = endpoint.send_message(&Message::ping()).await {
            warn!("sending ping failed, stopping ping loop: {}", e);
            break;
        }
        debug!("sent ping");
    }
    debug!("ping loop terminated");
}
