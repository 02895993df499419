//! Exchange lock and holder liveness
//!
//! A coordinator grants its lock to at most one holder at a time. The holder's
//! liveness is a cancellation token; when it fires, a watch task reports the
//! grant id back to the coordinator, which releases the lock only if that grant
//! is still the current one.

use crate::coordinator::request::Request;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc::WeakUnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Kind of exchange the lock is taken for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockType {
    /// Exchange driven by this node
    Local,
    /// Exchange requested by a remote peer
    Remote,
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockType::Local => write!(f, "local"),
            LockType::Remote => write!(f, "remote"),
        }
    }
}

/// Identity of a lock holder plus its liveness signal
///
/// Cancelling the token (or calling [`Holder::terminate`]) announces that the
/// holder is gone.
#[derive(Debug, Clone)]
pub struct Holder {
    id: String,
    liveness: CancellationToken,
}

impl Holder {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_liveness(id, CancellationToken::new())
    }

    pub fn with_liveness(id: impl Into<String>, liveness: CancellationToken) -> Self {
        Self {
            id: id.into(),
            liveness,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn liveness(&self) -> &CancellationToken {
        &self.liveness
    }

    pub fn terminate(&self) {
        self.liveness.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.liveness.is_cancelled()
    }
}

/// The currently granted lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LockToken {
    pub grant: u64,
    pub holder_id: String,
    pub lock_type: LockType,
}

/// Watch a holder and report its termination for `grant`
pub(crate) fn spawn_liveness_watch(grant: u64, holder: &Holder, mailbox: WeakUnboundedSender<Request>) {
    let liveness = holder.liveness.clone();
    let holder_id = holder.id.clone();
    tokio::spawn(async move {
        liveness.cancelled().await;
        debug!(grant, holder = %holder_id, "Lock holder terminated");
        if let Some(mailbox) = mailbox.upgrade() {
            let _ = mailbox.send(Request::HolderDown { grant });
        }
    });
}
