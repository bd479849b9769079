use crate::config::DialConfig;
use crate::utils::error::{GatewayError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use socket2::{SockRef, TcpKeepalive};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, trace};

/// Connectivity state of one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectivityState {
    Idle = 0,
    Connecting = 1,
    Ready = 2,
    TransientFailure = 3,
    Shutdown = 4,
}

impl ConnectivityState {
    /// Whether a pooled slot in this state may be handed out.
    #[inline]
    pub fn is_usable(self) -> bool {
        !matches!(
            self,
            ConnectivityState::TransientFailure | ConnectivityState::Shutdown
        )
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectivityState::Idle,
            1 => ConnectivityState::Connecting,
            2 => ConnectivityState::Ready,
            3 => ConnectivityState::TransientFailure,
            _ => ConnectivityState::Shutdown,
        }
    }
}

/// A physical connection that can be shared by several logical leases.
pub trait RpcConnection: Send + Sync + 'static {
    fn state(&self) -> ConnectivityState;

    /// Ask the transport to retry immediately instead of waiting out its
    /// reconnect backoff.
    fn reset_connect_backoff(&self);

    /// Tear the connection down. Must be idempotent.
    fn close(&self);
}

/// Dial primitive supplied by the transport layer.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Conn: RpcConnection;

    async fn dial(&self, address: &str) -> Result<Self::Conn>;
}

/// Dials plain TCP connections carrying length-delimited frames.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    /// Timeout for establishing new connections
    pub connect_timeout: Duration,
    /// TCP keepalive idle time, `None` disables keepalive probes
    pub keepalive: Option<Duration>,
    pub nodelay: bool,
    /// Largest frame accepted from the backend
    pub max_frame_length: usize,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::from(&DialConfig::default())
    }
}

impl From<&DialConfig> for TcpDialer {
    fn from(config: &DialConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            keepalive: (config.keepalive_secs > 0)
                .then(|| Duration::from_secs(config.keepalive_secs)),
            nodelay: config.nodelay,
            max_frame_length: config.max_frame_length,
        }
    }
}

impl TcpDialer {
    fn configure(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        if let Some(idle) = self.keepalive {
            SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    type Conn = TcpChannel;

    async fn dial(&self, address: &str) -> Result<TcpChannel> {
        let dial_error = |source: std::io::Error| GatewayError::Dial {
            address: address.to_string(),
            source,
        };

        let stream = match timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(dial_error(e)),
            Err(_) => {
                return Err(dial_error(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!(
                        "Connection to {} timed out after {:?}",
                        address, self.connect_timeout
                    ),
                )))
            }
        };

        self.configure(&stream).map_err(dial_error)?;
        let peer = stream.peer_addr().map_err(dial_error)?;
        debug!(address, %peer, "dialed upstream connection");

        Ok(TcpChannel::new(stream, peer, self.max_frame_length))
    }
}

/// One TCP connection to a backend, carrying length-delimited request and
/// reply frames. Calls from different leases are serialised on the stream.
pub struct TcpChannel {
    framed: Mutex<Framed<TcpStream, LengthDelimitedCodec>>,
    state: AtomicU8,
    peer: SocketAddr,
}

impl TcpChannel {
    fn new(stream: TcpStream, peer: SocketAddr, max_frame_length: usize) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_length)
            .new_codec();

        Self {
            framed: Mutex::new(Framed::new(stream, codec)),
            state: AtomicU8::new(ConnectivityState::Ready as u8),
            peer,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Send one request frame and wait for the matching reply frame.
    pub async fn call(&self, payload: Bytes) -> Result<BytesMut> {
        let mut framed = self.framed.lock().await;
        if self.state() == ConnectivityState::Shutdown {
            return Err(GatewayError::ConnectionClosed);
        }

        if let Err(e) = framed.send(payload).await {
            self.mark_failed();
            return Err(e.into());
        }

        match framed.next().await {
            Some(Ok(frame)) => {
                trace!(peer = %self.peer, len = frame.len(), "received reply frame");
                Ok(frame)
            }
            Some(Err(e)) => {
                self.mark_failed();
                Err(e.into())
            }
            None => {
                self.mark_failed();
                Err(GatewayError::ConnectionClosed)
            }
        }
    }

    fn mark_failed(&self) {
        // Never leave Shutdown once closed.
        let _ = self.state.compare_exchange(
            ConnectivityState::Ready as u8,
            ConnectivityState::TransientFailure as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

impl RpcConnection for TcpChannel {
    fn state(&self) -> ConnectivityState {
        ConnectivityState::from_u8(self.state.load(Ordering::Acquire))
    }

    // Plain TCP has no reconnect backoff; a failed channel stays failed.
    fn reset_connect_backoff(&self) {}

    fn close(&self) {
        let previous = self
            .state
            .swap(ConnectivityState::Shutdown as u8, Ordering::AcqRel);
        if previous == ConnectivityState::Shutdown as u8 {
            return;
        }

        // An in-flight call holds the lock; it fails on its own once the
        // channel is dropped.
        if let Ok(framed) = self.framed.try_lock() {
            let _ = SockRef::from(framed.get_ref()).shutdown(Shutdown::Both);
        }
        trace!(peer = %self.peer, "closed upstream connection");
    }
}
