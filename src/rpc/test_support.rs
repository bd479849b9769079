use crate::rpc::transport::{ConnectivityState, Dialer, RpcConnection};
use crate::utils::error::{GatewayError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct MockState {
    failed: AtomicU8,
    closed: AtomicBool,
    heals_on_reset: AtomicBool,
}

/// In-memory connection; clones observe the same state.
#[derive(Clone)]
pub(crate) struct MockConn {
    id: usize,
    state: Arc<MockState>,
}

impl MockConn {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            state: Arc::default(),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn fail(&self, heals_on_reset: bool) {
        self.state
            .heals_on_reset
            .store(heals_on_reset, Ordering::SeqCst);
        self.state.failed.store(1, Ordering::SeqCst);
    }
}

impl RpcConnection for MockConn {
    fn state(&self) -> ConnectivityState {
        if self.is_closed() {
            ConnectivityState::Shutdown
        } else if self.state.failed.load(Ordering::SeqCst) == 1 {
            ConnectivityState::TransientFailure
        } else {
            ConnectivityState::Ready
        }
    }

    fn reset_connect_backoff(&self) {
        if self.state.heals_on_reset.load(Ordering::SeqCst) {
            self.state.failed.store(0, Ordering::SeqCst);
        }
    }

    fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

/// In-memory dialer recording every connection it produced.
pub(crate) struct MockDialer {
    dialed: Mutex<Vec<MockConn>>,
    next_id: AtomicUsize,
    /// Number of further dials that succeed, `usize::MAX` when unlimited.
    budget: AtomicUsize,
}

impl MockDialer {
    pub(crate) fn new() -> Self {
        Self::failing_after(usize::MAX)
    }

    pub(crate) fn failing_after(successes: usize) -> Self {
        Self {
            dialed: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            budget: AtomicUsize::new(successes),
        }
    }

    pub(crate) fn set_budget(&self, successes: usize) {
        self.budget.store(successes, Ordering::SeqCst);
    }

    pub(crate) fn dialed(&self) -> Vec<MockConn> {
        self.dialed.lock().clone()
    }
}

#[async_trait]
impl Dialer for MockDialer {
    type Conn = MockConn;

    async fn dial(&self, address: &str) -> Result<MockConn> {
        let allowed = self
            .budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if !allowed {
            return Err(GatewayError::Dial {
                address: address.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            });
        }

        let conn = MockConn::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.dialed.lock().push(conn.clone());
        Ok(conn)
    }
}
