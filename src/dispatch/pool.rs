//! Sharded worker pool.
//!
//! # Responsibilities
//! - Partition dispatch across S independent FIFO shard queues
//! - Grow executors on demand, at most one per concurrent task
//! - Retire executors that stay idle past the configured lifetime
//! - Drain queued tasks on stop without waiting for in-flight handlers
//!
//! A single shared queue serialises dispatch across every core; sharding
//! removes that hotspot without an unbounded executor count. Submitters carry
//! a rotating shard cursor seeded with the accept-loop index, so consecutive
//! submissions from one loop land on different shards while the first hop
//! keeps per-loop affinity.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};

/// One unit of dispatch work, consumed by exactly one executor.
pub(crate) type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct Shard {
    /// Kept behind a mutex so `stop` can take the sender and close the queue.
    tx: std::sync::Mutex<Option<mpsc::UnboundedSender<Job>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>,
    /// Executors currently parked in the dequeue wait.
    idle: AtomicUsize,
}

impl Shard {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: std::sync::Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            idle: AtomicUsize::new(0),
        }
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Job>> {
        self.tx.lock().expect("shard sender lock poisoned").clone()
    }

    fn close(&self) {
        self.tx.lock().expect("shard sender lock poisoned").take();
    }
}

/// Shared bookkeeping: tasks submitted but not yet picked up by an executor,
/// and live executor count.
struct PoolState {
    pending: AtomicUsize,
    drained: Notify,
    live: AtomicUsize,
}

impl PoolState {
    fn task_started(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }
}

pub(crate) struct ShardedPool {
    shards: Vec<Arc<Shard>>,
    state: Arc<PoolState>,
    idle_lifetime: Duration,
    runtime: Handle,
}

impl ShardedPool {
    /// Create a pool with `shards` FIFO queues. Must be called within a tokio
    /// runtime; executors are spawned onto that runtime.
    pub(crate) fn new(shards: usize, idle_lifetime: Duration) -> Self {
        debug_assert!(shards > 0);
        Self {
            shards: (0..shards.max(1)).map(|_| Arc::new(Shard::new())).collect(),
            state: Arc::new(PoolState {
                pending: AtomicUsize::new(0),
                drained: Notify::new(),
                live: AtomicUsize::new(0),
            }),
            idle_lifetime,
            runtime: Handle::current(),
        }
    }

    /// A submission handle whose rotating cursor starts at `seed % shards`.
    pub(crate) fn submitter(&self, seed: usize) -> Submitter {
        Submitter {
            shards: self.shards.clone(),
            state: self.state.clone(),
            idle_lifetime: self.idle_lifetime,
            runtime: self.runtime.clone(),
            cursor: seed % self.shards.len(),
        }
    }

    /// Close every shard queue and wait until each queued task has been picked
    /// up by an executor. In-flight tasks keep running; completion is the
    /// wait-group's concern, not the pool's.
    pub(crate) async fn stop(self) {
        for shard in &self.shards {
            shard.close();
        }
        loop {
            let drained = self.state.drained.notified();
            if self.state.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            drained.await;
        }
    }

    #[cfg(test)]
    pub(crate) fn live_executors(&self) -> usize {
        self.state.live.load(Ordering::Acquire)
    }
}

/// Producer-side handle used by one accept loop.
pub(crate) struct Submitter {
    shards: Vec<Arc<Shard>>,
    state: Arc<PoolState>,
    idle_lifetime: Duration,
    runtime: Handle,
    cursor: usize,
}

impl Submitter {
    /// Enqueue `job` on the next shard and make sure an executor will pick it
    /// up: when no executor on that shard is idle, a new one is spawned.
    pub(crate) fn submit(&mut self, job: Job) {
        let shard = &self.shards[self.cursor];
        self.cursor = (self.cursor + 1) % self.shards.len();

        let Some(tx) = shard.sender() else {
            tracing::warn!("task submitted to a stopped worker pool; dropping");
            return;
        };

        self.state.pending.fetch_add(1, Ordering::AcqRel);
        if tx.send(job).is_err() {
            // Closed between `sender` and `send`; nothing consumed the slot.
            self.state.task_started();
            return;
        }

        if shard.idle.load(Ordering::Acquire) == 0 {
            self.state.live.fetch_add(1, Ordering::AcqRel);
            self.runtime.spawn(run_executor(
                shard.clone(),
                self.state.clone(),
                self.idle_lifetime,
            ));
        }
    }
}

/// Executor loop: drain the shard queue FIFO, exit after `idle_lifetime`
/// without work. Before exiting on idle, the queue gets one final sweep so a
/// task that raced the timeout is not stranded.
async fn run_executor(shard: Arc<Shard>, state: Arc<PoolState>, idle_lifetime: Duration) {
    loop {
        let job = {
            let mut rx = shard.rx.lock().await;
            shard.idle.fetch_add(1, Ordering::AcqRel);
            let received = tokio::time::timeout(idle_lifetime, rx.recv()).await;
            shard.idle.fetch_sub(1, Ordering::AcqRel);
            match received {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(_idle) => match rx.try_recv() {
                    Ok(job) => job,
                    Err(_) => break,
                },
            }
        };
        state.task_started();
        job.await;
    }
    state.live.fetch_sub(1, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn pool(shards: usize, idle: Duration) -> ShardedPool {
        ShardedPool::new(shards, idle)
    }

    #[tokio::test]
    async fn executes_submitted_jobs() {
        let p = pool(4, Duration::from_secs(5));
        let done = Arc::new(AtomicUsize::new(0));
        let mut submitter = p.submitter(0);

        for _ in 0..32 {
            let done = done.clone();
            submitter.submit(Box::pin(async move {
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while done.load(Ordering::SeqCst) != 32 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("all jobs should run");
    }

    #[tokio::test]
    async fn single_shard_dispatches_in_fifo_order() {
        // Current-thread test runtime: submissions all happen before any
        // executor task runs, and executors then drain the queue head-first.
        let p = pool(1, Duration::from_secs(5));
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut submitter = p.submitter(0);

        for i in 0..10usize {
            let order = order.clone();
            submitter.submit(Box::pin(async move {
                order.lock().unwrap().push(i);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }));
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn idle_executors_expire() {
        let p = pool(2, Duration::from_millis(50));
        let mut submitter = p.submitter(0);
        submitter.submit(Box::pin(async {}));
        submitter.submit(Box::pin(async {}));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(p.live_executors(), 0, "idle executors should have exited");
    }

    #[tokio::test]
    async fn stop_waits_for_queued_tasks_to_start() {
        let p = pool(1, Duration::from_secs(5));
        let started = Arc::new(AtomicUsize::new(0));
        let mut submitter = p.submitter(0);

        for _ in 0..3 {
            let started = started.clone();
            submitter.submit(Box::pin(async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }));
        }
        drop(submitter);

        tokio::time::timeout(Duration::from_secs(2), p.stop())
            .await
            .expect("stop should return once the queue is drained");
        assert_eq!(started.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn submit_after_stop_is_dropped() {
        let p = pool(1, Duration::from_secs(5));
        let mut submitter = p.submitter(0);
        let ran = Arc::new(AtomicUsize::new(0));

        p.stop().await;

        let counter = ran.clone();
        submitter.submit(Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
