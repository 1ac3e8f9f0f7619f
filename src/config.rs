//! Configuration schema for the server kernel.
//!
//! All types derive Serde traits so embedding applications can load them from
//! config files; every field has a default so partial configs work.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs for the accept engine, worker pool and memory behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Number of parallel accept loops. 0 selects the default (8).
    pub loops: usize,

    /// Number of worker-pool shards. 0 selects the default (2 x loops).
    pub worker_shards: usize,

    /// How long an idle worker executor lives before it exits.
    #[serde(with = "duration_secs")]
    pub worker_idle: Duration,

    /// Pin the first `loops / 2` accept loops to OS threads.
    pub lock_os_threads: bool,

    /// Size of the heap ballast buffer in MiB. 0 disables the ballast.
    pub ballast_size_mb: usize,

    /// Socket options applied while binding the listener.
    pub listen: ListenConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            loops: 0,
            worker_shards: 0,
            worker_idle: DEFAULT_WORKER_IDLE,
            lock_os_threads: false,
            ballast_size_mb: 0,
            listen: ListenConfig::default(),
        }
    }
}

/// Default number of accept loops when `loops` is 0.
pub const DEFAULT_LOOPS: usize = 8;

/// Default idle lifetime of a worker executor.
pub const DEFAULT_WORKER_IDLE: Duration = Duration::from_secs(5);

impl ServerConfig {
    /// Accept-loop count with the 0-means-default rule applied.
    pub fn effective_loops(&self) -> usize {
        if self.loops == 0 {
            DEFAULT_LOOPS
        } else {
            self.loops
        }
    }

    /// Worker-shard count with the 0-means-default rule applied.
    pub fn effective_worker_shards(&self) -> usize {
        if self.worker_shards == 0 {
            2 * self.effective_loops()
        } else {
            self.worker_shards
        }
    }
}

/// Kernel-level socket options for the listen socket.
///
/// `TCP_FASTOPEN` and `TCP_DEFER_ACCEPT` require Linux; on other platforms the
/// corresponding options are silently skipped by the applier.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Enable `SO_REUSEPORT` so several listeners (or processes) can share the
    /// port and the kernel balances accepts between them.
    pub reuse_port: bool,

    /// Enable `TCP_FASTOPEN` on the listen socket.
    pub fast_open: bool,

    /// Queue length for `TCP_FASTOPEN`. 0 selects the platform default (1024).
    pub fast_open_queue_len: u32,

    /// Enable `TCP_DEFER_ACCEPT` so accept fires only once data has arrived.
    pub defer_accept: bool,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            reuse_port: true,
            fast_open: false,
            fast_open_queue_len: 0,
            defer_accept: false,
        }
    }
}

/// `worker_idle` serialises as whole seconds so config files stay plain
/// numeric fields.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
