//! Logical connections and collection leases.
//!
//! A [`LogicalConnection`] binds an address and a collection name to a
//! [`ConnectionPool`]. It never owns a client itself: every unit of work
//! calls [`open`](LogicalConnection::open), uses the returned
//! [`CollectionLease`], and gives it back with [`CollectionLease::done`]
//! (or by dropping it).

use std::sync::Arc;

use tracing::debug;

use crate::config::ConnectOptions;
use crate::cursor::Cursor;
use crate::driver::Collection;
use crate::error::Result;
use crate::pool::ConnectionPool;

/// Application handle for one collection on one address.
///
/// Cheap to clone. Any number of logical connections, to the same or
/// different collections, share the pool's client for their address.
#[derive(Clone)]
pub struct LogicalConnection {
    pool: ConnectionPool,
    address: Arc<str>,
    collection: Arc<str>,
    options: ConnectOptions,
}

impl LogicalConnection {
    pub(crate) fn new(
        pool: ConnectionPool,
        address: String,
        collection: String,
        options: ConnectOptions,
    ) -> Self {
        Self {
            pool,
            address: address.into(),
            collection: collection.into(),
            options,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Acquire the shared client and resolve this connection's collection.
    ///
    /// On error nothing is held and nothing needs to be released.
    pub async fn open(&self) -> Result<CollectionLease> {
        let checkout = self.pool.acquire(&self.address, &self.options).await?;
        debug!(
            address = %self.address,
            collection = %self.collection,
            generation = checkout.generation(),
            "collection opened"
        );
        Ok(CollectionLease {
            collection: checkout.client().collection(&self.collection),
            pool: self.pool.clone(),
            address: Arc::clone(&self.address),
            generation: checkout.generation(),
        })
    }

    /// A new cursor bound to this connection.
    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.clone())
    }
}

impl std::fmt::Debug for LogicalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalConnection")
            .field("address", &self.address)
            .field("collection", &self.collection)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// One unit of work's hold on the shared client.
///
/// Releases its interest exactly once, either through [`done`](Self::done)
/// or on drop. The release is tied to the client the lease was opened on; a
/// lease that outlives its client (e.g. across [`ConnectionPool::shutdown`])
/// releases nothing.
pub struct CollectionLease {
    collection: Arc<dyn Collection>,
    pool: ConnectionPool,
    address: Arc<str>,
    generation: u64,
}

impl CollectionLease {
    pub fn collection(&self) -> &dyn Collection {
        self.collection.as_ref()
    }

    /// Signal that this unit of work is finished.
    pub fn done(self) {}
}

impl Drop for CollectionLease {
    fn drop(&mut self) {
        self.pool.release(&self.address, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::memory::MemoryDriver;

    const ADDR: &str = "mem://leases";

    fn connect(pool: &ConnectionPool, collection: &str) -> LogicalConnection {
        pool.connect(ADDR, ConnectOptions::new(collection)).unwrap()
    }

    #[tokio::test]
    async fn open_and_done_balance_the_pool() {
        let driver = MemoryDriver::new();
        let pool = ConnectionPool::new(Arc::new(driver.clone()));
        let conn = connect(&pool, "things");

        let lease = conn.open().await.unwrap();
        assert_eq!(pool.stats(ADDR).unwrap().ref_count, 1);
        lease.done();
        assert_eq!(pool.stats(ADDR).unwrap().ref_count, 0);
    }

    #[tokio::test]
    async fn dropped_lease_is_released() {
        let pool = ConnectionPool::new(Arc::new(MemoryDriver::new()));
        let conn = connect(&pool, "things");
        {
            let _lease = conn.open().await.unwrap();
            assert_eq!(pool.stats(ADDR).unwrap().ref_count, 1);
        }
        assert_eq!(pool.stats(ADDR).unwrap().ref_count, 0);
    }

    #[tokio::test]
    async fn two_logical_connections_share_one_client() {
        let driver = MemoryDriver::new();
        let pool = ConnectionPool::new(Arc::new(driver.clone()));
        let users = connect(&pool, "users");
        let orders = connect(&pool, "orders");

        let a = users.open().await.unwrap();
        let b = orders.open().await.unwrap();
        assert_eq!(driver.connect_count(), 1);
        assert_eq!(pool.stats(ADDR).unwrap().ref_count, 2);

        a.done();
        b.done();
    }

    #[tokio::test]
    async fn failed_open_owes_no_release() {
        let driver = MemoryDriver::new();
        driver.fail_next_connects(1, "connection refused");
        let pool = ConnectionPool::new(Arc::new(driver.clone()));
        let conn = connect(&pool, "things");

        assert!(conn.open().await.is_err());
        assert!(pool.stats(ADDR).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn lease_from_before_shutdown_leaves_new_client_alone() {
        let driver = MemoryDriver::new();
        let pool = ConnectionPool::new(Arc::new(driver.clone()));
        let conn = connect(&pool, "things");

        let stale = conn.open().await.unwrap();
        assert_eq!(pool.shutdown().await, 1);
        let fresh = conn.open().await.unwrap();
        assert_eq!(driver.connect_count(), 2);

        stale.done();
        let stats = pool.stats(ADDR).unwrap();
        assert_eq!(stats.ref_count, 1);
        assert!(!stats.idle_close_pending);

        let idle = conn.options().idle_close_delay;
        tokio::time::sleep(idle * 2).await;
        assert_eq!(driver.close_count(), 1);

        fresh.done();
        let stats = pool.stats(ADDR).unwrap();
        assert_eq!(stats.ref_count, 0);
        assert!(stats.idle_close_pending);
    }

    #[test]
    fn accessors_expose_binding() {
        let pool = ConnectionPool::new(Arc::new(MemoryDriver::new()));
        let conn = connect(&pool, "things");
        assert_eq!(conn.address(), ADDR);
        assert_eq!(conn.collection(), "things");
        assert_eq!(conn.options().max_retries, 1);
    }
}
