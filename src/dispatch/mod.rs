//! Task dispatch.
//!
//! Accept loops produce tasks; the sharded worker pool consumes them. Within
//! a shard dispatch is FIFO; across shards there is no ordering.

pub(crate) mod pool;

pub(crate) use pool::{ShardedPool, Submitter};
