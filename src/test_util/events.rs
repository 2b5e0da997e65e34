use std::fmt::Debug;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{sleep, timeout};
use tracing::warn;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Skips events until one matches `predicate`, and returns it. Panics if no matching event
///  arrives within [EVENT_TIMEOUT].
pub async fn wait_for_event<E: Clone + Debug>(events: &mut broadcast::Receiver<E>, predicate: impl Fn(&E) -> bool) -> E {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("test subscriber lagged, skipped {} events", n),
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    };

    match timeout(EVENT_TIMEOUT, wait).await {
        Ok(event) => event,
        Err(_) => panic!("timed out waiting for event"),
    }
}

/// Asserts that no event matching `predicate` arrives within `period`
pub async fn assert_no_event<E: Clone + Debug>(events: &mut broadcast::Receiver<E>, predicate: impl Fn(&E) -> bool, period: Duration) {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    };

    if let Ok(event) = timeout(period, wait).await {
        panic!("unexpected event {:?}", event);
    }
}

/// Polls `condition` until it holds. Panics if it does not hold within [EVENT_TIMEOUT].
pub async fn wait_until(condition: impl Fn() -> bool) {
    let poll = async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    };

    if timeout(EVENT_TIMEOUT, poll).await.is_err() {
        panic!("timed out waiting for condition");
    }
}
