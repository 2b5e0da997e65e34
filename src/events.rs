use std::fmt::Debug;
use tokio::sync::broadcast;
use tracing::{error, info, trace};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogSeverity {
    Log,
    Error,
}

/// Human readable status notification, emitted for every significant state transition in
///  addition to the structured events.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogStatus {
    pub severity: LogSeverity,
    pub text: String,
}

/// Implemented by the client and server event enums so the notifier can wrap log status text.
pub trait StatusEvent: Clone + Debug + Send + 'static {
    fn log_status(status: LogStatus) -> Self;
}

/// Fan-out of events to any number of subscribers. Events are sent synchronously from the task
///  that detected the condition, so a subscriber observes them in the order they happened.
///
/// Sending never blocks: a subscriber that falls behind by more than the channel capacity
///  misses events (and is told so by the broadcast channel).
pub struct EventNotifier<E: StatusEvent> {
    sender: broadcast::Sender<E>,
}
impl <E: StatusEvent> Default for EventNotifier<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl <E: StatusEvent> EventNotifier<E> {
    pub fn new() -> EventNotifier<E> {
        let (sender, _) = broadcast::channel(1024);

        EventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: E) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }

    pub fn log(&self, text: impl Into<String>) {
        let text = text.into();
        info!("{}", text);
        self.send_event(E::log_status(LogStatus { severity: LogSeverity::Log, text }));
    }

    pub fn log_error(&self, text: impl Into<String>) {
        let text = text.into();
        error!("{}", text);
        self.send_event(E::log_status(LogStatus { severity: LogSeverity::Error, text }));
    }
}
