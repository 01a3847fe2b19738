//! Security identities and the allocator seam.
//!
//! An identity is an allocator-owned entity referenced by endpoints. The
//! allocator's distributed coordination lives behind [`IdentityAllocator`];
//! this crate only needs allocate-or-reuse and the initial-sync barrier.

use crate::error::{Error, Result};
use crate::labels::LabelSet;
use crate::types::IdentityId;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio_util::sync::CancellationToken;

/// Identity id that is never allocated.
pub const IDENTITY_INVALID: IdentityId = IdentityId(0);

/// Reserved identity of the host endpoint.
pub const IDENTITY_HOST: IdentityId = IdentityId(1);

/// Reserved identity for traffic outside the cluster.
pub const IDENTITY_WORLD: IdentityId = IdentityId(2);

/// First id handed out for dynamically allocated local identities.
pub const FIRST_LOCAL_IDENTITY: u32 = 4096;

/// A security identity: a numeric id plus the label set it was derived from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,

    #[serde(default)]
    pub labels: LabelSet,

    /// Identity has a fixed, configuration-time mapping.
    #[serde(default)]
    pub fixed: bool,

    /// Identity is well known cluster-wide and needs no kvstore sync.
    #[serde(default)]
    pub well_known: bool,
}

impl Identity {
    /// A dynamically allocated identity.
    pub fn new(id: IdentityId, labels: LabelSet) -> Self {
        Self {
            id,
            labels,
            fixed: false,
            well_known: false,
        }
    }

    /// The reserved host identity.
    pub fn host() -> Self {
        Self {
            id: IDENTITY_HOST,
            labels: [crate::labels::Label::host()].into_iter().collect(),
            fixed: true,
            well_known: true,
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    pub fn is_well_known(&self) -> bool {
        self.well_known
    }
}

/// Allocator collaborator.
#[async_trait]
pub trait IdentityAllocator: Send + Sync {
    /// Allocate or reuse an identity for a label set. Returns the identity
    /// and whether a new allocation happened. `notify_owner` marks
    /// restore-time allocations; `old_id` is a hint from the previous run,
    /// [`IDENTITY_INVALID`] when there is none.
    async fn allocate_identity(
        &self,
        cancel: &CancellationToken,
        labels: &LabelSet,
        notify_owner: bool,
        old_id: IdentityId,
    ) -> Result<(Identity, bool)>;

    /// Block until the initial cluster-wide identity set has been synced.
    async fn wait_for_initial_global_identities(&self, cancel: &CancellationToken) -> Result<()>;
}

/// In-process allocator for single-node operation and tests. Ids are handed
/// out per distinct label set, starting at [`FIRST_LOCAL_IDENTITY`]; the
/// global-sync barrier is trivially satisfied.
#[derive(Debug, Default)]
pub struct LocalIdentityAllocator {
    by_labels: DashMap<String, IdentityId>,
    next: AtomicU32,
}

impl LocalIdentityAllocator {
    pub fn new() -> Self {
        Self {
            by_labels: DashMap::new(),
            next: AtomicU32::new(FIRST_LOCAL_IDENTITY),
        }
    }
}

#[async_trait]
impl IdentityAllocator for LocalIdentityAllocator {
    async fn allocate_identity(
        &self,
        cancel: &CancellationToken,
        labels: &LabelSet,
        _notify_owner: bool,
        _old_id: IdentityId,
    ) -> Result<(Identity, bool)> {
        if cancel.is_cancelled() {
            return Err(Error::NotAlive);
        }
        let key = labels.sorted_key();
        if let Some(existing) = self.by_labels.get(&key) {
            return Ok((Identity::new(*existing, labels.clone()), false));
        }
        let id = IdentityId(self.next.fetch_add(1, Ordering::SeqCst));
        self.by_labels.insert(key, id);
        Ok((Identity::new(id, labels.clone()), true))
    }

    async fn wait_for_initial_global_identities(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::NotAlive);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{Label, SOURCE_ORCHESTRATOR};

    fn labels(value: &str) -> LabelSet {
        [Label::new(SOURCE_ORCHESTRATOR, "app", value)]
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn test_local_allocator_reuses_per_label_set() {
        let allocator = LocalIdentityAllocator::new();
        let cancel = CancellationToken::new();

        let (first, allocated) = allocator
            .allocate_identity(&cancel, &labels("web"), true, IDENTITY_INVALID)
            .await
            .unwrap();
        assert!(allocated);
        assert_eq!(first.id.0, FIRST_LOCAL_IDENTITY);

        let (second, allocated) = allocator
            .allocate_identity(&cancel, &labels("web"), true, IDENTITY_INVALID)
            .await
            .unwrap();
        assert!(!allocated);
        assert_eq!(second.id, first.id);

        let (third, _) = allocator
            .allocate_identity(&cancel, &labels("db"), true, IDENTITY_INVALID)
            .await
            .unwrap();
        assert_ne!(third.id, first.id);
    }

    #[tokio::test]
    async fn test_local_allocator_observes_cancellation() {
        let allocator = LocalIdentityAllocator::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = allocator
            .allocate_identity(&cancel, &labels("web"), true, IDENTITY_INVALID)
            .await
            .unwrap_err();
        assert!(err.is_not_alive());
    }

    #[test]
    fn test_host_identity_flags() {
        let host = Identity::host();
        assert!(host.is_fixed());
        assert!(host.is_well_known());
        assert_eq!(host.id, IDENTITY_HOST);
    }

    #[test]
    fn test_identity_serde_defaults() {
        let json = r#"{"id": 4099}"#;
        let identity: Identity = serde_json::from_str(json).unwrap();
        assert!(!identity.is_fixed());
        assert!(!identity.is_well_known());
        assert!(identity.labels.is_empty());
    }
}
