mod conn;
pub mod metrics;
mod pool;
pub mod registry;
#[cfg(test)]
pub(crate) mod test_support;
mod transport;

pub use conn::PooledConn;
pub use metrics::PoolMetrics;
pub use pool::{CloseStatus, Pool, PoolOptions, PoolStatus};
pub use registry::{default_registry, init_default, PoolRegistry, RegistryConfig, STATUS_ALL};
pub use transport::{ConnectivityState, Dialer, RpcConnection, TcpChannel, TcpDialer};
