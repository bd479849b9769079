//! Per-address pool of long-lived, multiplexed RPC connections.
//!
//! A [`Pool`] owns up to `max_active` physical connections ("slots") to a
//! single backend address and shares them between any number of logical
//! leases, at most `max_concurrent_streams` leases per slot before it grows.
//!
//! ```text
//! get() ── refs += 1 ──┬─ fits in current * streams ──► round-robin slot
//!                      ├─ current == max_active ──┬─ reuse ──► round-robin slot
//!                      │                          └─ no reuse ► ephemeral dial
//!                      └─ otherwise ── grow (x2, <= max_active) ──► round-robin slot
//!
//! close(handle) ── refs -= 1 ── refs == 0 ──┬─ closing ──► tear everything down
//!                                           └─ current > max_idle ──► shrink to max_idle
//! ```
//!
//! `current`, `refs`, `index` and the close status are atomics. The slot array
//! sits behind a `parking_lot::RwLock` that is only written when slots are
//! installed or torn down and is never held across an await.

use crate::rpc::conn::{Lease, PooledConn};
use crate::rpc::metrics::PoolMetrics;
use crate::rpc::transport::{Dialer, RpcConnection};
use crate::utils::error::{GatewayError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Sizing and sharing policy of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOptions {
    /// Connections dialed eagerly and kept while the pool is idle
    #[serde(default = "default_max_idle")]
    pub max_idle: u32,
    /// Upper bound on pooled physical connections
    #[serde(default = "default_max_active")]
    pub max_active: u32,
    /// Logical leases one physical connection carries before the pool grows
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: u32,
    /// Share existing slots once `max_active` is reached instead of dialing
    /// one-time connections
    #[serde(default = "default_reuse")]
    pub reuse: bool,
}

fn default_max_idle() -> u32 {
    1
}

fn default_max_active() -> u32 {
    64
}

fn default_max_concurrent_streams() -> u32 {
    64
}

fn default_reuse() -> bool {
    true
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_idle: default_max_idle(),
            max_active: default_max_active(),
            max_concurrent_streams: default_max_concurrent_streams(),
            reuse: default_reuse(),
        }
    }
}

impl PoolOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_idle == 0 {
            return Err(GatewayError::Config(
                "pool max_idle must be greater than 0".to_string(),
            ));
        }

        if self.max_idle > self.max_active {
            return Err(GatewayError::Config(format!(
                "pool max_idle ({}) cannot exceed max_active ({})",
                self.max_idle, self.max_active
            )));
        }

        if self.max_active > i32::MAX as u32 {
            return Err(GatewayError::Config(format!(
                "pool max_active ({}) is too large",
                self.max_active
            )));
        }

        if self.max_concurrent_streams == 0 {
            return Err(GatewayError::Config(
                "pool max_concurrent_streams must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Lifecycle of a pool; only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CloseStatus {
    Ready = 0,
    Closing = 1,
    Closed = 2,
}

impl CloseStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CloseStatus::Ready,
            1 => CloseStatus::Closing,
            _ => CloseStatus::Closed,
        }
    }
}

/// Diagnostic snapshot of a pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub address: String,
    pub status: CloseStatus,
    pub index: u32,
    pub current: i32,
    #[serde(rename = "ref")]
    pub refs: i32,
    pub options: PoolOptions,
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(
                f,
                "address={} status={:?} index={} current={} ref={}",
                self.address, self.status, self.index, self.current, self.refs
            ),
        }
    }
}

/// Pool of physical connections to one address.
pub struct Pool<D: Dialer> {
    address: String,
    options: PoolOptions,
    dialer: Arc<D>,
    slots: RwLock<Vec<Option<Arc<D::Conn>>>>,
    current: AtomicI32,
    refs: AtomicI32,
    index: AtomicU32,
    status: AtomicU8,
    grow_lock: tokio::sync::Mutex<()>,
}

impl<D: Dialer> Pool<D> {
    /// Build a pool and eagerly dial `max_idle` connections.
    ///
    /// Fails without leaving any connection open if the options are invalid
    /// or any of the initial dials fails.
    pub async fn new(
        address: impl Into<String>,
        options: PoolOptions,
        dialer: Arc<D>,
    ) -> Result<Arc<Self>> {
        let address = address.into();
        if address.trim().is_empty() {
            return Err(GatewayError::Config(
                "pool address cannot be empty".to_string(),
            ));
        }
        options.validate()?;

        let mut slots: Vec<Option<Arc<D::Conn>>> = Vec::with_capacity(options.max_active as usize);
        for _ in 0..options.max_idle {
            match dialer.dial(&address).await {
                Ok(conn) => {
                    PoolMetrics::record_dial("slot");
                    slots.push(Some(Arc::new(conn)));
                }
                Err(e) => {
                    PoolMetrics::record_dial_failure();
                    for conn in slots.iter().flatten() {
                        conn.close();
                    }
                    return Err(e);
                }
            }
        }
        slots.resize_with(options.max_active as usize, || None);

        info!(
            address = %address,
            max_idle = options.max_idle,
            max_active = options.max_active,
            max_concurrent_streams = options.max_concurrent_streams,
            reuse = options.reuse,
            "created connection pool"
        );
        PoolMetrics::pool_opened();

        Ok(Arc::new(Self {
            current: AtomicI32::new(options.max_idle as i32),
            address,
            options,
            dialer,
            slots: RwLock::new(slots),
            refs: AtomicI32::new(0),
            index: AtomicU32::new(0),
            status: AtomicU8::new(CloseStatus::Ready as u8),
            grow_lock: tokio::sync::Mutex::new(()),
        }))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Number of physical slots currently installed.
    pub fn current(&self) -> i32 {
        self.current.load(Ordering::SeqCst)
    }

    /// Number of outstanding logical leases.
    pub fn refs(&self) -> i32 {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn close_status(&self) -> CloseStatus {
        CloseStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn is_closed(&self) -> bool {
        self.close_status() == CloseStatus::Closed
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            address: self.address.clone(),
            status: self.close_status(),
            index: self.index.load(Ordering::Relaxed),
            current: self.current(),
            refs: self.refs(),
            options: self.options.clone(),
        }
    }

    pub fn status_string(&self) -> String {
        self.status().to_string()
    }

    /// Lease a connection.
    ///
    /// Never waits for capacity: at most one attempt per installed slot is
    /// made and [`GatewayError::FetchFailed`] is returned once they are all
    /// spent. Dials (growth and ephemeral connections) are bounded by the
    /// dialer's own timeout and are abandoned if the returned future is
    /// dropped.
    pub async fn get(self: &Arc<Self>) -> Result<PooledConn<D::Conn>> {
        let attempts = self.current().max(1);
        let mut last_error = None;

        for _ in 0..attempts {
            match self.try_get().await {
                Err(e @ GatewayError::FetchFailed(_)) => {
                    PoolMetrics::record_fetch_failure();
                    last_error = Some(e);
                }
                other => return other,
            }
        }

        Err(last_error.unwrap_or_else(|| GatewayError::FetchFailed(self.address.clone())))
    }

    /// Mark the pool closing; slots are torn down once the last lease is
    /// returned.
    pub fn close(&self) {
        if self
            .status
            .compare_exchange(
                CloseStatus::Ready as u8,
                CloseStatus::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        let refs = self.refs();
        if refs == 0 {
            self.finish_close();
        } else {
            debug!(address = %self.address, refs, "pool closing, waiting for leases");
        }
    }

    /// Tear a closing pool down immediately, ignoring outstanding leases.
    ///
    /// Returns whether this call performed the transition to closed.
    pub fn force_close(&self) -> bool {
        let refs = self.refs();
        let closed = self.finish_close();
        if closed && refs > 0 {
            warn!(address = %self.address, refs, "force closed pool with outstanding leases");
        }
        closed
    }

    async fn try_get(self: &Arc<Self>) -> Result<PooledConn<D::Conn>> {
        if self.close_status() != CloseStatus::Ready {
            return Err(GatewayError::PoolClosed(self.address.clone()));
        }

        let next_ref = self.incr_ref();
        let lease = LeaseGuard::new(self);

        // A close may have raced with the increment above.
        if self.close_status() != CloseStatus::Ready {
            return Err(GatewayError::PoolClosed(self.address.clone()));
        }

        let current = self.current();
        if self.fits(next_ref, current) {
            let conn = self.pick_slot()?;
            return Ok(lease.into_slot(conn));
        }

        if current >= self.options.max_active as i32 {
            if self.options.reuse {
                let conn = self.pick_slot()?;
                return Ok(lease.into_slot(conn));
            }

            let conn = self.dial_ephemeral().await?;
            return Ok(lease.into_ephemeral(conn));
        }

        self.grow(next_ref).await?;
        let conn = self.pick_slot()?;
        Ok(lease.into_slot(conn))
    }

    #[inline]
    fn fits(&self, refs: i32, current: i32) -> bool {
        i64::from(refs) <= i64::from(current) * i64::from(self.options.max_concurrent_streams)
    }

    /// Round-robin over the installed slots. An unusable slot gets one
    /// backoff reset; if that does not help, this attempt fails.
    fn pick_slot(&self) -> Result<Arc<D::Conn>> {
        let slots = self.slots.read();
        let current = self.current();
        if current <= 0 {
            return Err(GatewayError::FetchFailed(self.address.clone()));
        }

        let index = self.index.fetch_add(1, Ordering::Relaxed) % current as u32;
        let conn = slots
            .get(index as usize)
            .and_then(|slot| slot.clone())
            .ok_or_else(|| GatewayError::FetchFailed(self.address.clone()))?;

        if !conn.state().is_usable() {
            conn.reset_connect_backoff();
            let state = conn.state();
            if !state.is_usable() {
                trace!(address = %self.address, index, ?state, "skipping unusable slot");
                return Err(GatewayError::FetchFailed(self.address.clone()));
            }
        }

        Ok(conn)
    }

    async fn dial_ephemeral(&self) -> Result<Arc<D::Conn>> {
        match self.dialer.dial(&self.address).await {
            Ok(conn) => {
                PoolMetrics::record_dial("ephemeral");
                trace!(address = %self.address, "dialed ephemeral connection");
                Ok(Arc::new(conn))
            }
            Err(e) => {
                PoolMetrics::record_dial_failure();
                Err(e)
            }
        }
    }

    /// Double the installed slots (bounded by `max_active`). Connections that
    /// were dialed before a failure are kept.
    async fn grow(&self, next_ref: i32) -> Result<()> {
        let _growing = self.grow_lock.lock().await;

        let current = self.current();
        let max_active = self.options.max_active as i32;
        if self.fits(next_ref, current) || current >= max_active {
            return Ok(());
        }

        let target = current.saturating_mul(2).min(max_active);
        let mut dialed = Vec::with_capacity((target - current) as usize);
        let mut failure = None;
        for _ in current..target {
            match self.dialer.dial(&self.address).await {
                Ok(conn) => {
                    PoolMetrics::record_dial("slot");
                    dialed.push(Arc::new(conn));
                }
                Err(e) => {
                    PoolMetrics::record_dial_failure();
                    failure = Some(e);
                    break;
                }
            }
        }

        let grown_to = {
            let mut slots = self.slots.write();
            if self.close_status() != CloseStatus::Ready {
                for conn in &dialed {
                    conn.close();
                }
                return Err(GatewayError::PoolClosed(self.address.clone()));
            }

            let mut installed = self.current() as usize;
            for conn in dialed {
                match slots.get_mut(installed) {
                    Some(slot) => {
                        *slot = Some(conn);
                        installed += 1;
                    }
                    None => conn.close(),
                }
            }
            self.current.store(installed as i32, Ordering::SeqCst);
            installed
        };

        match failure {
            Some(e) => {
                warn!(
                    address = %self.address,
                    from = current,
                    to = grown_to,
                    error = %e,
                    "pool growth stopped early"
                );
                Err(e)
            }
            None => {
                debug!(address = %self.address, from = current, to = grown_to, "pool grew");
                Ok(())
            }
        }
    }

    fn incr_ref(&self) -> i32 {
        let previous = self.refs.fetch_add(1, Ordering::SeqCst);
        if previous < 0 || previous == i32::MAX {
            panic!(
                "reference count of pool {} corrupted on acquire (was {})",
                self.address, previous
            );
        }
        previous + 1
    }

    fn decr_ref(&self) {
        let previous = self.refs.fetch_sub(1, Ordering::SeqCst);
        if previous <= 0 {
            panic!(
                "reference count of pool {} went negative (was {})",
                self.address, previous
            );
        }
        if previous != 1 {
            return;
        }

        match self.close_status() {
            CloseStatus::Closing => {
                self.finish_close();
            }
            CloseStatus::Ready if self.current() > self.options.max_idle as i32 => {
                self.shrink();
            }
            _ => {}
        }
    }

    fn shrink(&self) {
        let mut slots = self.slots.write();
        if self.refs() != 0 || self.close_status() != CloseStatus::Ready {
            return;
        }

        let max_idle = self.options.max_idle as usize;
        let current = self.current() as usize;
        if current <= max_idle {
            return;
        }

        for slot in &mut slots[max_idle..current] {
            if let Some(conn) = slot.take() {
                conn.close();
            }
        }
        self.current.store(max_idle as i32, Ordering::SeqCst);
        debug!(address = %self.address, from = current, to = max_idle, "pool shrank");
    }

    /// Move closing -> closed and tear every slot down. Only one caller wins.
    fn finish_close(&self) -> bool {
        if self
            .status
            .compare_exchange(
                CloseStatus::Closing as u8,
                CloseStatus::Closed as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return false;
        }

        let mut slots = self.slots.write();
        let mut torn_down = 0usize;
        for slot in slots.iter_mut() {
            if let Some(conn) = slot.take() {
                conn.close();
                torn_down += 1;
            }
        }
        self.current.store(0, Ordering::SeqCst);
        drop(slots);

        PoolMetrics::pool_closed();
        info!(address = %self.address, connections = torn_down, "connection pool closed");
        true
    }
}

impl<D: Dialer> Lease for Pool<D> {
    fn release(&self) {
        self.decr_ref();
    }
}

impl<D: Dialer> fmt::Debug for Pool<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool").field("status", &self.status()).finish()
    }
}

/// Gives a freshly taken reference back unless it was turned into a handle.
struct LeaseGuard<'a, D: Dialer> {
    pool: &'a Arc<Pool<D>>,
    armed: bool,
}

impl<'a, D: Dialer> LeaseGuard<'a, D> {
    fn new(pool: &'a Arc<Pool<D>>) -> Self {
        Self { pool, armed: true }
    }

    fn into_slot(mut self, conn: Arc<D::Conn>) -> PooledConn<D::Conn> {
        self.armed = false;
        PooledConn::slot(conn, self.pool.clone())
    }

    fn into_ephemeral(mut self, conn: Arc<D::Conn>) -> PooledConn<D::Conn> {
        self.armed = false;
        PooledConn::ephemeral(conn, self.pool.clone())
    }
}

impl<D: Dialer> Drop for LeaseGuard<'_, D> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.decr_ref();
        }
    }
}
