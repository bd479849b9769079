#![allow(dead_code)]

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tradegate::rpc::{ConnectivityState, Dialer, RpcConnection};
use tradegate::{GatewayError, Result};

#[derive(Default)]
struct FakeState {
    failed: AtomicBool,
    closed: AtomicBool,
}

/// In-memory connection; clones observe the same state.
#[derive(Clone)]
pub struct FakeConn {
    pub id: usize,
    state: Arc<FakeState>,
}

impl FakeConn {
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn fail(&self) {
        self.state.failed.store(true, Ordering::SeqCst);
    }
}

impl RpcConnection for FakeConn {
    fn state(&self) -> ConnectivityState {
        if self.is_closed() {
            ConnectivityState::Shutdown
        } else if self.state.failed.load(Ordering::SeqCst) {
            ConnectivityState::TransientFailure
        } else {
            ConnectivityState::Ready
        }
    }

    fn reset_connect_backoff(&self) {}

    fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

/// Dialer handing out `FakeConn`s, optionally slowed down or refusing.
#[derive(Default)]
pub struct FakeDialer {
    dialed: Mutex<Vec<FakeConn>>,
    next_id: AtomicUsize,
    refuse: AtomicBool,
    delay: Option<Duration>,
}

impl FakeDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn dialed(&self) -> Vec<FakeConn> {
        self.dialed.lock().unwrap().clone()
    }

    pub fn dial_count(&self) -> usize {
        self.dialed.lock().unwrap().len()
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    type Conn = FakeConn;

    async fn dial(&self, address: &str) -> Result<FakeConn> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.refuse.load(Ordering::SeqCst) {
            return Err(GatewayError::Dial {
                address: address.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            });
        }

        let conn = FakeConn {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            state: Arc::default(),
        };
        self.dialed.lock().unwrap().push(conn.clone());
        Ok(conn)
    }
}

/// Loopback backend echoing every length-delimited frame it receives.
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
                while let Some(Ok(frame)) = framed.next().await {
                    if framed.send(frame.freeze()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    addr
}
