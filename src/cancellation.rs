//! Cooperative cancellation for analysis requests
//!
//! Every computation accepts a [`CancellationToken`]. Cancelling a token also
//! cancels all of its children, so a service-wide shutdown token can fan out to
//! per-request tokens.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct TokenState {
    id: u64,
    cancelled: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Arc<TokenState>>>,
}

impl TokenState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed),
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
            children: Mutex::new(Vec::new()),
        })
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.notify.notify_waiters();

        let children = match self.children.lock() {
            Ok(mut children) => std::mem::take(&mut *children),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for child in children {
            child.cancel();
        }
    }
}

/// Cloneable cancellation signal
#[derive(Debug, Clone)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            state: TokenState::new(),
        }
    }

    /// Token that is cancelled whenever `self` is cancelled
    pub fn child_token(&self) -> Self {
        let child = TokenState::new();
        if self.is_cancelled() {
            child.cancel();
            return Self { state: child };
        }

        match self.state.children.lock() {
            Ok(mut children) => children.push(child.clone()),
            Err(poisoned) => poisoned.into_inner().push(child.clone()),
        }
        // Parent may have been cancelled between the check and the push.
        if self.is_cancelled() {
            child.cancel();
        }
        Self { state: child }
    }

    /// Process-unique id of this token
    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn cancel(&self) {
        self.state.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once the token is cancelled
    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// `Err(EngineError::Cancelled)` when cancellation was requested
    pub fn check(&self) -> crate::error::EngineResult<()> {
        if self.is_cancelled() {
            Err(crate::error::EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
