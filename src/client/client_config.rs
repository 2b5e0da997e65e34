use std::time::Duration;

use crate::session::receive_loop::ReceiveConfig;
use crate::util::retry::RetryPolicy;

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// attempts to reach the rendezvous port, and the delays between them
    pub retry: RetryPolicy,
    pub ping_interval: Duration,
    /// maximum silence from the server before the client drops the session
    pub response_timeout: Duration,
    pub receive_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig::new(Duration::from_secs(10), Duration::from_secs(15))
    }
}

impl ClientConfig {
    /// A response timeout shorter than the ping interval would drop every quiet session, so it is
    ///  raised to one second more than the ping interval in that case.
    pub fn new(ping_interval: Duration, response_timeout: Duration) -> ClientConfig {
        let response_timeout = if response_timeout < ping_interval {
            ping_interval + Duration::from_secs(1)
        }
        else {
            response_timeout
        };

        ClientConfig {
            retry: RetryPolicy::new(50),
            ping_interval,
            response_timeout,
            receive_buffer_size: 512,
        }
    }

    pub fn connect_attempts(&self) -> u32 {
        self.retry.max_attempts
    }

    pub fn receive_config(&self) -> ReceiveConfig {
        ReceiveConfig {
            response_timeout: self.response_timeout,
            buffer_size: self.receive_buffer_size,
        }
    }
}
