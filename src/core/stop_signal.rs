use parking_lot::Mutex;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Run-wide abort signal.
///
/// Cloned into the dispatcher and every node task. Nodes receive a child token
/// so an abort reaches them without them being able to abort the run.
#[derive(Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal that is also triggered when `parent` is cancelled.
    pub fn linked(parent: &CancellationToken) -> Self {
        StopSignal {
            token: parent.child_token(),
            reason: Arc::default(),
        }
    }

    /// Request an abort. The first reason wins.
    pub fn trigger(&self, reason: Option<String>) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                *slot = reason;
            }
        }
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}
