//! Global concurrency limiter
//!
//! Caps how many tree builds and remote exchanges run at once across all
//! partitions of a node. Permits are never queued for: a saturated limiter
//! answers `MaxConcurrency` immediately.

use crate::coordinator::Holder;
use crate::error::CoordinatorError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Held by a build worker for the duration of one build or rehash
#[derive(Debug)]
pub struct BuildPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

impl BuildPermit {
    /// A permit not backed by any limit
    pub fn unlimited() -> Self {
        Self { _permit: None }
    }
}

/// Limiter interface
#[async_trait]
pub trait ConcurrencyLimiter: Send + Sync {
    async fn acquire_build_permit(&self) -> Result<BuildPermit, CoordinatorError>;

    /// Admit a remote exchange for `holder`
    ///
    /// Releasing the slot is the limiter's responsibility.
    async fn acquire_remote_exchange_permit(&self, holder: &Holder) -> Result<(), CoordinatorError>;
}

/// Semaphore-backed limiter
///
/// Remote exchange slots are returned when the holder's liveness token fires.
#[derive(Debug, Clone)]
pub struct SemaphoreLimiter {
    builds: Arc<Semaphore>,
    exchanges: Arc<Semaphore>,
}

impl SemaphoreLimiter {
    pub fn new(max_builds: usize, max_exchanges: usize) -> Self {
        Self {
            builds: Arc::new(Semaphore::new(max_builds)),
            exchanges: Arc::new(Semaphore::new(max_exchanges)),
        }
    }

    pub fn available_builds(&self) -> usize {
        self.builds.available_permits()
    }

    pub fn available_exchanges(&self) -> usize {
        self.exchanges.available_permits()
    }
}

impl Default for SemaphoreLimiter {
    fn default() -> Self {
        Self::new(2, 2)
    }
}

#[async_trait]
impl ConcurrencyLimiter for SemaphoreLimiter {
    async fn acquire_build_permit(&self) -> Result<BuildPermit, CoordinatorError> {
        let permit = Arc::clone(&self.builds)
            .try_acquire_owned()
            .map_err(|_| CoordinatorError::MaxConcurrency)?;
        Ok(BuildPermit {
            _permit: Some(permit),
        })
    }

    async fn acquire_remote_exchange_permit(&self, holder: &Holder) -> Result<(), CoordinatorError> {
        let permit = Arc::clone(&self.exchanges)
            .try_acquire_owned()
            .map_err(|_| CoordinatorError::MaxConcurrency)?;

        let liveness = holder.liveness().clone();
        let holder_id = holder.id().to_string();
        tokio::spawn(async move {
            liveness.cancelled().await;
            debug!(holder = %holder_id, "Releasing remote exchange permit");
            drop(permit);
        });
        Ok(())
    }
}
