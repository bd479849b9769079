#[cfg(feature = "metrics")]
use lazy_static::lazy_static;
#[cfg(feature = "metrics")]
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

#[cfg(feature = "metrics")]
lazy_static! {
    pub static ref ACTIVE_POOLS: IntGauge = register_int_gauge!(
        "tradegate_pools_active",
        "Number of connection pools that have not finished closing"
    )
    .expect("register tradegate_pools_active gauge");
    pub static ref CONNECTIONS_DIALED: IntCounterVec = register_int_counter_vec!(
        "tradegate_pool_connections_dialed_total",
        "Physical connections dialed by pools, by kind (slot or ephemeral)",
        &["kind"]
    )
    .expect("register tradegate_pool_connections_dialed_total counter vec");
    pub static ref DIAL_FAILURES: IntCounter = register_int_counter!(
        "tradegate_pool_dial_failures_total",
        "Dials that failed during pool fill, growth or ephemeral connects"
    )
    .expect("register tradegate_pool_dial_failures_total counter");
    pub static ref FETCH_FAILURES: IntCounter = register_int_counter!(
        "tradegate_pool_fetch_failures_total",
        "Get attempts that found an unusable slot"
    )
    .expect("register tradegate_pool_fetch_failures_total counter");
    pub static ref POOL_LEAKS: IntCounter = register_int_counter!(
        "tradegate_pool_leaks_total",
        "Retired pools force closed after outliving the leak threshold"
    )
    .expect("register tradegate_pool_leaks_total counter");
    pub static ref RETIRE_DROPPED: IntCounter = register_int_counter!(
        "tradegate_pool_retire_dropped_total",
        "Retired pools not tracked because the leak queue was full or closed"
    )
    .expect("register tradegate_pool_retire_dropped_total counter");
}

#[derive(Debug, Clone, Copy)]
pub struct PoolMetrics;

#[cfg(feature = "metrics")]
impl PoolMetrics {
    #[inline]
    pub fn pool_opened() {
        ACTIVE_POOLS.inc();
    }

    #[inline]
    pub fn pool_closed() {
        ACTIVE_POOLS.dec();
    }

    #[inline]
    pub fn record_dial(kind: &str) {
        CONNECTIONS_DIALED.with_label_values(&[kind]).inc();
    }

    #[inline]
    pub fn record_dial_failure() {
        DIAL_FAILURES.inc();
    }

    #[inline]
    pub fn record_fetch_failure() {
        FETCH_FAILURES.inc();
    }

    #[inline]
    pub fn record_leak() {
        POOL_LEAKS.inc();
    }

    #[inline]
    pub fn record_retire_dropped() {
        RETIRE_DROPPED.inc();
    }
}

#[cfg(not(feature = "metrics"))]
impl PoolMetrics {
    #[inline]
    pub fn pool_opened() {}

    #[inline]
    pub fn pool_closed() {}

    #[inline]
    pub fn record_dial(_kind: &str) {}

    #[inline]
    pub fn record_dial_failure() {}

    #[inline]
    pub fn record_fetch_failure() {}

    #[inline]
    pub fn record_leak() {}

    #[inline]
    pub fn record_retire_dropped() {}
}

#[cfg(feature = "metrics")]
#[inline]
pub fn init() {
    lazy_static::initialize(&ACTIVE_POOLS);
    lazy_static::initialize(&CONNECTIONS_DIALED);
    lazy_static::initialize(&DIAL_FAILURES);
    lazy_static::initialize(&FETCH_FAILURES);
    lazy_static::initialize(&POOL_LEAKS);
    lazy_static::initialize(&RETIRE_DROPPED);
}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn init() {}

/// Prometheus text exposition of every registered metric.
#[cfg(feature = "metrics")]
pub fn render() -> String {
    use prometheus::{Encoder, TextEncoder};

    let mut buffer = Vec::new();
    if TextEncoder::new()
        .encode(&prometheus::gather(), &mut buffer)
        .is_err()
    {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(not(feature = "metrics"))]
pub fn render() -> String {
    String::new()
}
