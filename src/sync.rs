//! Connection wait-group.

use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::Notify;

/// Counts in-flight connections and lets the lifecycle controller wait for
/// the count to drain to zero.
///
/// `add` is called once per dispatched connection at accept time and `done`
/// exactly once when the handler has returned and the stream is closed, so a
/// waiter that observes zero knows no handler is executing.
#[derive(Debug, Default)]
pub struct WaitGroup {
    count: AtomicI64,
    drained: Notify,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `n` additional in-flight connections.
    pub fn add(&self, n: i64) {
        self.count.fetch_add(n, Ordering::AcqRel);
    }

    /// Mark one connection as finished, waking waiters when the count drains.
    pub fn done(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Current in-flight count.
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }

    /// Wait until the count reaches zero.
    pub async fn wait(&self) {
        loop {
            // Arm the notification before the check so a concurrent final
            // `done` between load and await cannot be missed.
            let drained = self.drained.notified();
            if self.count.load(Ordering::Acquire) <= 0 {
                return;
            }
            drained.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn wait_returns_immediately_when_empty() {
        let wg = WaitGroup::new();
        wg.wait().await;
    }

    #[tokio::test]
    async fn wait_blocks_until_all_done() {
        let wg = Arc::new(WaitGroup::new());
        wg.add(2);

        let waiter = {
            let wg = wg.clone();
            tokio::spawn(async move { wg.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        wg.done();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        wg.done();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish once drained")
            .unwrap();
        assert_eq!(wg.count(), 0);
    }
}
