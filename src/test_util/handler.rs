use std::sync::Mutex;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::protocol::framing::FramingError;
use crate::protocol::message::Message;
use crate::session::receive_loop::{DisconnectReason, SessionHandler};

/// A [SessionHandler] that records everything it is told, for inspection by test code
#[derive(Default)]
pub struct RecordingSessionHandler {
    messages: Mutex<Vec<Message>>,
    protocol_faults: Mutex<Vec<String>>,
    ended: Mutex<Vec<DisconnectReason>>,
    changed: Notify,
}

impl RecordingSessionHandler {
    pub fn new() -> Self {
        Default::default()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    pub async fn protocol_faults(&self) -> Vec<String> {
        self.protocol_faults.lock().unwrap().clone()
    }

    pub async fn ended(&self) -> Vec<DisconnectReason> {
        self.ended.lock().unwrap().clone()
    }

    /// waits (for a limited time) until at least `n` messages were received
    pub async fn wait_for_messages(&self, n: usize) {
        let wait = async {
            loop {
                let notified = self.changed.notified();
                if self.messages.lock().unwrap().len() >= n {
                    return;
                }
                notified.await;
            }
        };
        if timeout(Duration::from_secs(5), wait).await.is_err() {
            panic!("timed out waiting for {} messages, got {:?}", n, self.messages.lock().unwrap());
        }
    }
}

#[async_trait]
impl SessionHandler for RecordingSessionHandler {
    async fn on_message(&self, message: Message) {
        self.messages.lock().unwrap().push(message);
        self.changed.notify_waiters();
    }

    fn on_protocol_fault(&self, fragment: &str, _error: &FramingError) {
        self.protocol_faults.lock().unwrap().push(fragment.to_string());
        self.changed.notify_waiters();
    }

    async fn on_session_ended(&self, reason: DisconnectReason) {
        self.ended.lock().unwrap().push(reason);
        self.changed.notify_waiters();
    }
}
