// tradegate - RPC connection pooling for the trading API gateway

pub mod api;
pub mod config;
pub mod rpc;
pub mod utils;

// Re-export commonly used types
pub use rpc::{Pool, PoolOptions, PoolRegistry, PooledConn, RegistryConfig};
pub use utils::error::{GatewayError, Result};
