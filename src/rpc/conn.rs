use crate::rpc::transport::RpcConnection;
use std::fmt;
use std::sync::Arc;

/// Something that hands out logical leases and takes them back.
pub(crate) trait Lease: Send + Sync {
    fn release(&self);
}

/// A leased connection returned by [`Pool::get`](crate::rpc::Pool::get).
///
/// Slot handles share a pooled physical connection: closing them only gives
/// the lease back. Ephemeral handles own a one-time connection that is closed
/// for real on release. Dropping a handle closes it.
pub struct PooledConn<C: RpcConnection> {
    conn: Option<Arc<C>>,
    owner: Option<Arc<dyn Lease>>,
    ephemeral: bool,
}

impl<C: RpcConnection> PooledConn<C> {
    pub(crate) fn slot(conn: Arc<C>, owner: Arc<dyn Lease>) -> Self {
        Self {
            conn: Some(conn),
            owner: Some(owner),
            ephemeral: false,
        }
    }

    pub(crate) fn ephemeral(conn: Arc<C>, owner: Arc<dyn Lease>) -> Self {
        Self {
            conn: Some(conn),
            owner: Some(owner),
            ephemeral: true,
        }
    }

    /// The underlying physical connection, `None` once the handle is closed.
    pub fn client(&self) -> Option<&C> {
        self.conn.as_deref()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    /// Give the lease back to the pool. Calling this more than once is a no-op.
    pub fn close(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        if self.ephemeral {
            conn.close();
        }

        if let Some(owner) = self.owner.take() {
            owner.release();
        }
    }
}

impl<C: RpcConnection> Drop for PooledConn<C> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<C: RpcConnection> fmt::Debug for PooledConn<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConn")
            .field("ephemeral", &self.ephemeral)
            .field("closed", &self.is_closed())
            .finish()
    }
}
