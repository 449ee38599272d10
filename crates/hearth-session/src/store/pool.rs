//! Bounded connection pool for remote stores.
//!
//! At most `size` connections are checked out at once. Borrowing waits up
//! to the borrow timeout and then fails with `StoreUnavailable` instead of
//! blocking indefinitely. A checked-out [`PooledConnection`] goes back to
//! the pool when dropped, on every exit path; a connection whose command
//! failed or timed out is discarded instead.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::store::kv::{KvConnection, KvConnector};

struct PoolInner<C: KvConnector> {
    connector: C,
    idle: Mutex<Vec<C::Conn>>,
    permits: Arc<Semaphore>,
    size: usize,
    borrow_timeout: Duration,
    op_timeout: Duration,
}

/// Connection pool for one backend node.
pub struct Pool<C: KvConnector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: KvConnector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: KvConnector> Pool<C> {
    pub fn new(connector: C, config: &PoolConfig) -> Self {
        let size = config.size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                connector,
                idle: Mutex::new(Vec::with_capacity(size)),
                permits: Arc::new(Semaphore::new(size)),
                size,
                borrow_timeout: config.borrow_timeout(),
                op_timeout: config.op_timeout(),
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        self.inner.connector.endpoint()
    }

    /// Connections currently checked out.
    pub fn in_use(&self) -> usize {
        self.inner.size - self.inner.permits.available_permits()
    }

    /// Idle connections ready for reuse.
    pub fn idle(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Borrow a connection, opening one if none is idle.
    pub async fn get(&self) -> Result<PooledConnection<C>> {
        let permit = match tokio::time::timeout(
            self.inner.borrow_timeout,
            Arc::clone(&self.inner.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(Error::StoreUnavailable(format!(
                    "connection pool for {} is closed",
                    self.endpoint()
                )));
            }
            Err(_) => {
                return Err(Error::StoreUnavailable(format!(
                    "connection pool for {} exhausted after {:?}",
                    self.endpoint(),
                    self.inner.borrow_timeout
                )));
            }
        };

        let idle = self.inner.idle.lock().pop();
        let conn = match idle {
            Some(conn) => conn,
            None => {
                debug!(endpoint = %self.endpoint(), "Opening store connection");
                bounded("connect", self.inner.op_timeout, self.inner.connector.connect()).await?
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Refuse further borrows and drop idle connections.
    pub fn close(&self) {
        self.inner.permits.close();
        let dropped = std::mem::take(&mut *self.inner.idle.lock()).len();
        debug!(endpoint = %self.endpoint(), dropped, "Closed connection pool");
    }
}

/// Run `fut` with an upper bound, mapping expiry to `Error::Timeout`.
async fn bounded<T>(
    op: &'static str,
    after: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| Error::Timeout { op, after })?
}

/// A borrowed connection. Returned to the pool on drop unless a command
/// on it failed.
pub struct PooledConnection<C: KvConnector> {
    conn: Option<C::Conn>,
    pool: Arc<PoolInner<C>>,
    _permit: OwnedSemaphorePermit,
}

impl<C: KvConnector> PooledConnection<C> {
    fn conn(&mut self) -> Result<&mut C::Conn> {
        self.conn
            .as_mut()
            .ok_or_else(|| Error::StoreUnavailable("connection was discarded".into()))
    }

    /// Discard the connection after a failed command; it may be half-read.
    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            trace!(endpoint = %self.pool.connector.endpoint(), "Discarding store connection");
            self.conn = None;
        }
        result
    }

    pub async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        let after = self.pool.op_timeout;
        let result = bounded("get", after, self.conn()?.get(key)).await;
        self.settle(result)
    }

    pub async fn set(&mut self, key: &str, value: &[u8], ttl_secs: Option<u64>) -> Result<()> {
        let after = self.pool.op_timeout;
        let result = bounded("set", after, self.conn()?.set(key, value, ttl_secs)).await;
        self.settle(result)
    }

    pub async fn del(&mut self, key: &str) -> Result<bool> {
        let after = self.pool.op_timeout;
        let result = bounded("del", after, self.conn()?.del(key)).await;
        self.settle(result)
    }

    pub async fn exists(&mut self, key: &str) -> Result<bool> {
        let after = self.pool.op_timeout;
        let result = bounded("exists", after, self.conn()?.exists(key)).await;
        self.settle(result)
    }
}

impl<C: KvConnector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take()
            && !self.pool.permits.is_closed()
        {
            self.pool.idle.lock().push(conn);
        }
    }
}
