//! Connection-object pool.
//!
//! An unbounded lock-free free-list that recycles connection objects across
//! requests so steady-state serving performs no per-connection allocation.
//! On a miss the user-supplied factory allocates a fresh object; the caller
//! is responsible for binding a stream via `Connection::reset` afterwards.

use std::sync::Arc;

use crossbeam_queue::SegQueue;

use super::connection::{Connection, ConnectionFactory, TcpConnection};

pub(crate) struct ConnectionPool {
    free: SegQueue<Box<dyn Connection>>,
    factory: std::sync::RwLock<ConnectionFactory>,
}

impl ConnectionPool {
    pub(crate) fn new() -> Self {
        Self {
            free: SegQueue::new(),
            factory: std::sync::RwLock::new(Arc::new(|| {
                Box::new(TcpConnection::new()) as Box<dyn Connection>
            })),
        }
    }

    /// Replace the factory used on pool misses.
    pub(crate) fn set_factory(&self, factory: ConnectionFactory) {
        *self.factory.write().expect("factory lock poisoned") = factory;
    }

    /// Pop a recycled object or allocate a fresh one.
    pub(crate) fn rent(&self) -> Box<dyn Connection> {
        match self.free.pop() {
            Some(conn) => conn,
            None => {
                let factory = self.factory.read().expect("factory lock poisoned").clone();
                factory()
            }
        }
    }

    /// Return an object to the free-list. The object is cleared first so no
    /// stream or context survives into the next rental.
    pub(crate) fn put(&self, mut conn: Box<dyn Connection>) {
        conn.clear();
        self.free.push(conn);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn miss_allocates_and_return_recycles() {
        let pool = ConnectionPool::new();
        assert_eq!(pool.len(), 0);

        let conn = pool.rent();
        pool.put(conn);
        assert_eq!(pool.len(), 1);

        let _conn = pool.rent();
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn custom_factory_used_on_miss_only() {
        let allocations = Arc::new(AtomicUsize::new(0));
        let pool = ConnectionPool::new();
        let counter = allocations.clone();
        pool.set_factory(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::new(TcpConnection::new())
        }));

        let first = pool.rent();
        assert_eq!(allocations.load(Ordering::SeqCst), 1);

        pool.put(first);
        let _again = pool.rent();
        assert_eq!(allocations.load(Ordering::SeqCst), 1, "hit must not allocate");
    }

    #[tokio::test]
    async fn returned_objects_are_cleared() {
        let pool = ConnectionPool::new();
        let mut conn = pool.rent();
        conn.set_context(Arc::new(7u8));
        pool.put(conn);

        let mut conn = pool.rent();
        assert!(
            conn.context().downcast_ref::<u8>().is_none(),
            "context must not leak across rentals"
        );
    }
}
