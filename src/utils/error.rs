use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dial {address} failed: {source}")]
    Dial {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Pool for {0} is closed")]
    PoolClosed(String),

    /// The selected slot was not usable; the caller may try again.
    #[error("Fetch connection to {0} failed, try again")]
    FetchFailed(String),

    #[error("No pool available for {0}")]
    NoPool(String),

    #[error("Connection closed")]
    ConnectionClosed,
}

impl GatewayError {
    /// Whether retrying the same call may succeed.
    ///
    /// `PoolClosed` is not retryable; callers must resolve a fresh pool
    /// through the registry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::FetchFailed(_) | GatewayError::Dial { .. })
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
