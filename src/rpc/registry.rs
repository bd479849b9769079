//! Address -> pool registry with background leak detection.
//!
//! Pools are created lazily on the first `get_conn` for an address. When
//! service discovery reports that backend instances went away it calls
//! [`PoolRegistry::remove`]; the removed pools close gracefully and, if they
//! still have leases outstanding, are handed to the leak detector which
//! force-closes them once they have been retired for longer than
//! `leak_threshold`.

use crate::config::RegistrySettings;
use crate::rpc::conn::PooledConn;
use crate::rpc::metrics::{self, PoolMetrics};
use crate::rpc::pool::{Pool, PoolOptions, PoolStatus};
use crate::rpc::transport::{Dialer, TcpChannel, TcpDialer};
use crate::utils::error::{GatewayError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Target accepted by [`PoolRegistry::get_status`] to report every pool.
pub const STATUS_ALL: &str = "all";

/// Registry tuning.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Options used for every pool the registry builds
    pub pool: PoolOptions,
    /// How often retired pools are inspected
    pub leak_sweep_interval: Duration,
    /// How long a retired pool may keep leases before it is force closed
    pub leak_threshold: Duration,
    /// Capacity of the retired-pool queue
    pub retired_capacity: usize,
    /// Delay before the leak detector restarts after a panic
    pub daemon_restart_backoff: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            pool: PoolOptions::default(),
            leak_sweep_interval: Duration::from_secs(30 * 60),
            leak_threshold: Duration::from_secs(30 * 60),
            retired_capacity: 1024,
            daemon_restart_backoff: Duration::from_secs(1),
        }
    }
}

impl RegistryConfig {
    pub fn new(pool: PoolOptions, settings: &RegistrySettings) -> Self {
        Self {
            pool,
            leak_sweep_interval: Duration::from_secs(settings.leak_sweep_interval_secs),
            leak_threshold: Duration::from_secs(settings.leak_threshold_secs),
            retired_capacity: settings.retired_capacity,
            ..Default::default()
        }
    }
}

struct Retired<D: Dialer> {
    pool: Arc<Pool<D>>,
    retired_at: Instant,
}

type Tracked<D> = Arc<Mutex<VecDeque<Retired<D>>>>;

/// Map of address -> [`Pool`].
pub struct PoolRegistry<D: Dialer> {
    config: RegistryConfig,
    dialer: Arc<D>,
    pools: RwLock<HashMap<String, Arc<Pool<D>>>>,
    build_lock: tokio::sync::Mutex<()>,
    retired_tx: Mutex<Option<mpsc::Sender<Retired<D>>>>,
    tracked: Tracked<D>,
    closed: AtomicBool,
    daemon: Mutex<Option<JoinHandle<()>>>,
}

impl<D: Dialer> PoolRegistry<D> {
    /// Create a registry and start its leak detector.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: RegistryConfig, dialer: D) -> Self {
        Self::with_shared_dialer(config, Arc::new(dialer))
    }

    pub fn with_shared_dialer(config: RegistryConfig, dialer: Arc<D>) -> Self {
        metrics::init();

        let (retired_tx, retired_rx) = mpsc::channel(config.retired_capacity.max(1));
        let tracked: Tracked<D> = Arc::new(Mutex::new(VecDeque::new()));
        let daemon = spawn_leak_detector(retired_rx, tracked.clone(), &config);

        Self {
            config,
            dialer,
            pools: RwLock::new(HashMap::new()),
            build_lock: tokio::sync::Mutex::new(()),
            retired_tx: Mutex::new(Some(retired_tx)),
            tracked,
            closed: AtomicBool::new(false),
            daemon: Mutex::new(Some(daemon)),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Lease a connection to `address`, building its pool on first use.
    pub async fn get_conn(&self, address: &str) -> Result<PooledConn<D::Conn>> {
        let pool = self.pool_for(address).await?;
        pool.get().await
    }

    /// The pool currently serving `address`, if any.
    pub fn pool(&self, address: &str) -> Option<Arc<Pool<D>>> {
        self.pools.read().get(address).cloned()
    }

    async fn pool_for(&self, address: &str) -> Result<Arc<Pool<D>>> {
        let existing = self.pool(address);
        if let Some(pool) = existing {
            return Ok(pool);
        }

        let _building = self.build_lock.lock().await;
        let existing = self.pool(address);
        if let Some(pool) = existing {
            return Ok(pool);
        }

        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::NoPool(address.to_string()));
        }

        let pool = match Pool::new(address, self.config.pool.clone(), self.dialer.clone()).await {
            Ok(pool) => pool,
            Err(e) => {
                error!(address, error = %e, "failed to create connection pool");
                return Err(GatewayError::NoPool(address.to_string()));
            }
        };

        {
            // close() may have swapped the map out while the pool was dialing.
            let mut pools = self.pools.write();
            if !self.closed.load(Ordering::SeqCst) {
                pools.insert(address.to_string(), pool.clone());
                return Ok(pool);
            }
        }

        debug!(address, "registry closed during pool construction, discarding pool");
        pool.close();
        Err(GatewayError::NoPool(address.to_string()))
    }

    /// Drop the pools of `addresses` from the registry and close them.
    ///
    /// Later `get_conn` calls for those addresses build brand-new pools, even
    /// while the old ones are still draining.
    ///
    /// Returns the addresses that actually had a pool.
    pub fn remove<S: AsRef<str>>(&self, addresses: &[S]) -> Vec<String> {
        let removed: Vec<Arc<Pool<D>>> = {
            let mut pools = self.pools.write();
            addresses
                .iter()
                .filter_map(|address| pools.remove(address.as_ref()))
                .collect()
        };

        let mut names = Vec::with_capacity(removed.len());
        for pool in removed {
            names.push(pool.address().to_string());
            pool.close();
            if pool.is_closed() {
                debug!(address = pool.address(), "removed idle pool");
            } else {
                info!(
                    address = pool.address(),
                    refs = pool.refs(),
                    "removed pool still has leases, tracking for leaks"
                );
                self.retire(pool);
            }
        }
        names
    }

    /// Remove every pooled address missing from a discovery snapshot.
    pub fn sync_instances<S: AsRef<str>>(&self, live: &[S]) -> Vec<String> {
        let live: HashSet<&str> = live.iter().map(|s| s.as_ref()).collect();
        let stale: Vec<String> = self
            .pools
            .read()
            .keys()
            .filter(|address| !live.contains(address.as_str()))
            .cloned()
            .collect();

        if stale.is_empty() {
            return stale;
        }
        self.remove(&stale)
    }

    fn retire(&self, pool: Arc<Pool<D>>) {
        let sender = self.retired_tx.lock().clone();
        let Some(sender) = sender else {
            warn!(address = pool.address(), "leak detector stopped, pool left draining");
            PoolMetrics::record_retire_dropped();
            return;
        };

        let retired = Retired {
            pool,
            retired_at: Instant::now(),
        };
        if let Err(e) = sender.try_send(retired) {
            let retired = match e {
                mpsc::error::TrySendError::Full(retired)
                | mpsc::error::TrySendError::Closed(retired) => retired,
            };
            warn!(
                address = retired.pool.address(),
                "leak queue unavailable, pool left draining untracked"
            );
            PoolMetrics::record_retire_dropped();
        }
    }

    /// Close every pool and stop the leak detector.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let pools = std::mem::take(&mut *self.pools.write());
        let count = pools.len();
        for pool in pools.into_values() {
            pool.close();
        }

        // The detector exits once the queue is closed and every retired pool
        // it tracks has closed.
        self.retired_tx.lock().take();
        info!(pools = count, "pool registry closed");
    }

    /// One pool's status, or every pool's status keyed by address for
    /// [`STATUS_ALL`].
    pub fn get_status(&self, target: &str) -> Option<String> {
        if target == STATUS_ALL {
            return serde_json::to_string(&self.statuses()).ok();
        }
        self.pool(target).map(|pool| pool.status_string())
    }

    pub fn status(&self, address: &str) -> Option<PoolStatus> {
        self.pool(address).map(|pool| pool.status())
    }

    pub fn statuses(&self) -> BTreeMap<String, PoolStatus> {
        self.pools
            .read()
            .iter()
            .map(|(address, pool)| (address.clone(), pool.status()))
            .collect()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.pools.read().keys().cloned().collect()
    }

    /// Retired pools the leak detector is currently watching.
    pub fn retired_count(&self) -> usize {
        self.tracked.lock().len()
    }

    /// Whether the leak detector task is still running.
    pub fn leak_detector_running(&self) -> bool {
        self.daemon
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl<D: Dialer> Drop for PoolRegistry<D> {
    fn drop(&mut self) {
        if let Some(daemon) = self.daemon.lock().take() {
            daemon.abort();
        }
    }
}

fn spawn_leak_detector<D: Dialer>(
    retired_rx: mpsc::Receiver<Retired<D>>,
    tracked: Tracked<D>,
    config: &RegistryConfig,
) -> JoinHandle<()> {
    let interval = config.leak_sweep_interval.max(Duration::from_millis(1));
    let threshold = config.leak_threshold;
    let receiver = Arc::new(tokio::sync::Mutex::new(retired_rx));

    supervise("pool leak detector", config.daemon_restart_backoff, move || {
        watch_retired(receiver.clone(), tracked.clone(), interval, threshold)
    })
}

/// Run the task produced by `make` and start a fresh one after `backoff`
/// whenever it panics. Returns once a run completes normally.
pub(crate) fn supervise<F, Fut>(name: &'static str, backoff: Duration, mut make: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match tokio::spawn(make()).await {
                Ok(()) => break,
                Err(e) if e.is_panic() => {
                    error!(task = name, "background task panicked, restarting in {:?}", backoff);
                    tokio::time::sleep(backoff).await;
                }
                Err(_) => break,
            }
        }
        debug!(task = name, "background task stopped");
    })
}

async fn watch_retired<D: Dialer>(
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Retired<D>>>>,
    tracked: Tracked<D>,
    interval: Duration,
    threshold: Duration,
) {
    let mut receiver = receiver.lock().await;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut accepting = true;
    loop {
        tokio::select! {
            retired = receiver.recv(), if accepting => match retired {
                Some(retired) => tracked.lock().push_back(retired),
                None => accepting = false,
            },
            _ = ticker.tick() => {
                let leaked = sweep_retired(&tracked, threshold);
                if leaked > 0 {
                    warn!(leaked, "force closed leaked pools");
                }
            }
        }

        // Pools retired before the queue closed are still swept until they
        // close or get force closed.
        if !accepting && tracked.lock().is_empty() {
            break;
        }
    }
}

/// Drop closed pools from the watch list and force-close the ones retired
/// for at least `threshold`. Returns how many were force closed.
fn sweep_retired<D: Dialer>(tracked: &Tracked<D>, threshold: Duration) -> usize {
    let mut tracked = tracked.lock();
    let mut leaked = 0;

    tracked.retain(|retired| {
        if retired.pool.is_closed() {
            return false;
        }

        let age = retired.retired_at.elapsed();
        if age < threshold {
            return true;
        }

        warn!(
            address = retired.pool.address(),
            refs = retired.pool.refs(),
            retired_secs = age.as_secs(),
            "pool leaked leases, force closing"
        );
        PoolMetrics::record_leak();
        retired.pool.force_close();
        leaked += 1;
        false
    });

    leaked
}

static DEFAULT_REGISTRY: OnceLock<PoolRegistry<TcpDialer>> = OnceLock::new();

/// Install the process-wide registry. Returns `false` if one already exists.
///
/// Must be called from within a tokio runtime.
pub fn init_default(config: RegistryConfig, dialer: TcpDialer) -> bool {
    let mut installed = false;
    DEFAULT_REGISTRY.get_or_init(|| {
        installed = true;
        PoolRegistry::new(config, dialer)
    });
    installed
}

/// The process-wide registry, built with defaults on first use.
///
/// Equivalent to passing an explicitly constructed [`PoolRegistry`] around;
/// it only exists for call sites that do not carry one.
pub fn default_registry() -> &'static PoolRegistry<TcpDialer> {
    DEFAULT_REGISTRY.get_or_init(|| PoolRegistry::new(RegistryConfig::default(), TcpDialer::default()))
}

pub async fn get_conn(address: &str) -> Result<PooledConn<TcpChannel>> {
    default_registry().get_conn(address).await
}

pub fn remove<S: AsRef<str>>(addresses: &[S]) -> Vec<String> {
    default_registry().remove(addresses)
}

pub fn close() {
    default_registry().close()
}

pub fn get_status(target: &str) -> Option<String> {
    default_registry().get_status(target)
}
