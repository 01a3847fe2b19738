//! Datapath regeneration seams and the startup fence.
//!
//! The actual program generation is an external collaborator reached through
//! [`Datapath`]; restore only needs to request a rebuild and wait on its
//! completion signal. The [`Regenerator`] additionally gates restore-time
//! regeneration behind a fence that releases once all registered startup
//! initializers have completed.

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How much of the endpoint's datapath a regeneration rebuilds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RegenerationLevel {
    /// Only rewrite load-balancing state.
    RewriteLoadBalancer,

    /// Recompute policy without recompiling the datapath.
    WithoutDatapath,

    /// Full rebuild including the datapath programs.
    WithDatapath,
}

/// Reason and scope of a requested regeneration.
#[derive(Debug, Clone)]
pub struct RegenerationContext {
    pub reason: String,
    pub level: RegenerationLevel,
}

impl RegenerationContext {
    pub fn new(reason: impl Into<String>, level: RegenerationLevel) -> Self {
        Self {
            reason: reason.into(),
            level,
        }
    }
}

/// Datapath build collaborator. The returned receiver yields `true` when the
/// build succeeded.
pub trait Datapath: Send + Sync {
    fn regenerate(&self, endpoint: Arc<Endpoint>, ctx: RegenerationContext)
        -> oneshot::Receiver<bool>;
}

/// Network-interface lookup collaborator.
pub trait LinkResolver: Send + Sync {
    /// Resolve an interface name to its numeric index.
    fn ifindex_by_name(&self, name: &str) -> Result<u32>;
}

/// Refreshes externally sourced labels for an endpoint. Invoked
/// fire-and-forget after a restored endpoint has its identity back.
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    async fn resolve_metadata(&self, endpoint: Arc<Endpoint>) -> Result<()>;
}

/// Owns the startup fence gating restore-time regeneration.
#[derive(Debug)]
pub struct Regenerator {
    pending: AtomicUsize,
    released: watch::Sender<bool>,
}

/// Completion handle for one registered startup initializer.
#[derive(Debug)]
pub struct InitializerHandle {
    regenerator: Arc<Regenerator>,
}

impl InitializerHandle {
    /// Mark this initializer complete. The fence releases when the last
    /// registered initializer completes.
    pub fn done(self) {
        self.regenerator.initializer_done();
    }
}

impl Default for Regenerator {
    fn default() -> Self {
        let (released, _) = watch::channel(false);
        Self {
            pending: AtomicUsize::new(0),
            released,
        }
    }
}

impl Regenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a startup initializer that must complete before any
    /// restore-time regeneration proceeds. Registration is only meaningful
    /// before the fence has released.
    pub fn register_initializer(self: &Arc<Self>) -> InitializerHandle {
        self.pending.fetch_add(1, Ordering::SeqCst);
        InitializerHandle {
            regenerator: self.clone(),
        }
    }

    fn initializer_done(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.release_fence();
        }
    }

    /// Release the fence unconditionally.
    pub fn release_fence(&self) {
        debug!("Releasing regeneration fence");
        self.released.send_replace(true);
    }

    /// Whether the fence has released.
    pub fn fence_released(&self) -> bool {
        *self.released.borrow()
    }

    /// Wait for the fence, preempted by the endpoint's alive signal.
    pub async fn wait_for_fence(&self, cancel: &CancellationToken) -> Result<()> {
        let mut rx = self.released.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::NotAlive),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(Error::NotAlive);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fence_wait_returns_after_release() {
        let regenerator = Arc::new(Regenerator::new());
        let cancel = CancellationToken::new();

        let waiter = {
            let regenerator = regenerator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { regenerator.wait_for_fence(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        regenerator.release_fence();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_fence_wait_is_cancelable() {
        let regenerator = Arc::new(Regenerator::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = regenerator.wait_for_fence(&cancel).await.unwrap_err();
        assert!(err.is_not_alive());
    }

    #[tokio::test]
    async fn test_fence_releases_when_last_initializer_completes() {
        let regenerator = Arc::new(Regenerator::new());
        let first = regenerator.register_initializer();
        let second = regenerator.register_initializer();

        first.done();
        assert!(!regenerator.fence_released());

        second.done();
        assert!(regenerator.fence_released());

        let cancel = CancellationToken::new();
        regenerator.wait_for_fence(&cancel).await.unwrap();
    }

    #[test]
    fn test_regeneration_level_ordering() {
        assert!(RegenerationLevel::WithDatapath > RegenerationLevel::WithoutDatapath);
        assert!(RegenerationLevel::WithoutDatapath > RegenerationLevel::RewriteLoadBalancer);
    }
}
