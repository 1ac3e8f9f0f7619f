//! Shutdown coordination.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Instant;

use tokio::sync::broadcast;

/// Coordinator for graceful shutdown.
///
/// Carries a once-latched flag, a broadcast channel every accept loop
/// subscribes to, and the drain deadline recorded when shutdown was requested.
/// The flag answers "are we shutting down", the broadcast provides the wake-up
/// edge for loops parked inside `accept`.
#[derive(Debug)]
pub struct ShutdownSignal {
    triggered: AtomicBool,
    tx: broadcast::Sender<()>,
    deadline: RwLock<Option<Instant>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            triggered: AtomicBool::new(false),
            tx,
            deadline: RwLock::new(None),
        }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Latch the flag, record the drain deadline and wake subscribers.
    ///
    /// `deadline` of `None` means "wait indefinitely for active connections".
    /// Triggering twice keeps the first recorded deadline.
    pub fn trigger(&self, deadline: Option<Instant>) {
        if !self.triggered.swap(true, Ordering::AcqRel) {
            *self.deadline.write().expect("deadline lock poisoned") = deadline;
        }
        let _ = self.tx.send(());
    }

    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Deadline recorded by the first `trigger`, if any.
    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.read().expect("deadline lock poisoned")
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn trigger_wakes_subscribers() {
        let signal = ShutdownSignal::new();
        let mut rx = signal.subscribe();
        signal.trigger(None);
        assert!(signal.is_triggered());
        rx.recv().await.expect("subscriber should observe trigger");
    }

    #[test]
    fn first_deadline_wins() {
        let signal = ShutdownSignal::new();
        let first = Instant::now() + Duration::from_secs(1);
        signal.trigger(Some(first));
        signal.trigger(None);
        assert_eq!(signal.deadline(), Some(first));
    }
}
