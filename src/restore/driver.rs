//! Per-endpoint restore sequencing.
//!
//! For each restored endpoint, in order: recover the host ifindex, restore
//! the security identity, kick the metadata resolver, regenerate the
//! datapath. Drivers for different endpoints run as independent tasks; the
//! only thing they share is the host endpoint id published by the manager.
//!
//! Every blocking step races against the endpoint's alive signal. Identity
//! allocation and the initial-global-identities wait run on managed
//! controllers so that their retries are cancelled with the endpoint instead
//! of leaking.

use crate::config::AgentConfig;
use crate::controller::{ControllerManager, ControllerParams};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::identity::{Identity, IdentityAllocator, IDENTITY_INVALID};
use crate::labels::LabelFilter;
use crate::regeneration::{
    Datapath, LinkResolver, MetadataResolver, RegenerationContext, RegenerationLevel, Regenerator,
};
use crate::types::{EndpointId, EndpointState};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

const RESTORE_IDENTITY_GROUP: &str = "restore-endpoint-identity";
const INITIAL_GLOBAL_IDENTITIES_GROUP: &str = "initial-global-identities";

/// Outcome of a batch restore pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreStats {
    /// Endpoints fully restored and regenerated.
    pub restored: u32,

    /// Endpoints whose restore failed.
    pub failed: u32,

    /// Endpoints deleted while their restore was in flight.
    pub not_alive: u32,
}

/// Drives the restore sequence for individual endpoints.
///
/// All collaborators are shared handles; the driver itself is cheap to clone
/// into per-endpoint tasks.
#[derive(Clone)]
pub struct RestoreDriver {
    pub config: AgentConfig,
    pub allocator: Arc<dyn IdentityAllocator>,
    pub controllers: Arc<ControllerManager>,
    pub regenerator: Arc<Regenerator>,
    pub datapath: Arc<dyn Datapath>,
    pub links: Arc<dyn LinkResolver>,
    pub metadata: Arc<dyn MetadataResolver>,
    pub label_filter: Arc<dyn LabelFilter>,
}

impl RestoreDriver {
    /// Restore one endpoint end to end:
    /// recover the host ifindex, restore the identity, refresh metadata,
    /// then regenerate and wait for the build result.
    pub async fn regenerate_after_restore(&self, ep: &Arc<Endpoint>) -> Result<()> {
        self.restore_host_ifindex(ep)?;

        self.restore_identity(ep).await?;

        // With the identity back, fetch the latest orchestrator labels for
        // this endpoint in the background.
        let metadata = self.metadata.clone();
        let ep_for_metadata = ep.clone();
        tokio::spawn(async move {
            if let Err(e) = metadata.resolve_metadata(ep_for_metadata.clone()).await {
                warn!(
                    endpoint_id = ep_for_metadata.id(),
                    error = %e,
                    "Metadata refresh for restored endpoint failed"
                );
            }
        });

        let completion = self.datapath.regenerate(
            ep.clone(),
            RegenerationContext::new("syncing state to host", RegenerationLevel::WithDatapath),
        );
        let built = completion.await.unwrap_or(false);
        if !built {
            return Err(Error::Regeneration(
                "failed while regenerating restored endpoint".into(),
            ));
        }

        info!(
            endpoint_id = ep.id(),
            ipv4 = ?ep.ipv4_address(),
            ipv6 = ?ep.ipv6_address(),
            "Restored endpoint"
        );
        Ok(())
    }

    /// Restore every endpoint concurrently, one task each, and collect the
    /// per-category outcome counts. No endpoint's failure affects another.
    pub async fn restore_all(
        &self,
        endpoints: impl IntoIterator<Item = Arc<Endpoint>>,
    ) -> RestoreStats {
        let mut tasks = Vec::new();
        for ep in endpoints {
            let driver = self.clone();
            tasks.push(tokio::spawn(async move {
                let result = driver.regenerate_after_restore(&ep).await;
                (ep.id(), result)
            }));
        }

        let mut stats = RestoreStats::default();
        for task in tasks {
            match task.await {
                Ok((_, Ok(()))) => stats.restored += 1,
                Ok((id, Err(e))) if e.is_not_alive() => {
                    info!(endpoint_id = id, "Endpoint deleted during restore, skipping");
                    stats.not_alive += 1;
                }
                Ok((id, Err(e))) => {
                    error!(endpoint_id = id, error = %e, "Unable to restore endpoint");
                    stats.failed += 1;
                }
                Err(e) => {
                    error!(error = %e, "Endpoint restore task failed");
                    stats.failed += 1;
                }
            }
        }

        info!(
            restored = stats.restored,
            failed = stats.failed,
            not_alive = stats.not_alive,
            "Endpoint restore completed"
        );
        stats
    }

    /// Populate the host endpoint's ifindex from the live network stack.
    ///
    /// Older agents persisted the host endpoint with a zero ifindex, so the
    /// restored value cannot be trusted; a failed lookup is fatal for this
    /// endpoint because regeneration needs the index.
    fn restore_host_ifindex(&self, ep: &Arc<Endpoint>) -> Result<()> {
        if !ep.is_host() {
            return Ok(());
        }

        let if_name = {
            let inner = ep.read_alive()?;
            if inner.if_index() != 0 {
                return Ok(());
            }
            inner.if_name().to_string()
        };

        let index = self.links.ifindex_by_name(&if_name)?;

        let mut inner = ep.lock_alive()?;
        inner.if_index = index;
        Ok(())
    }

    /// Re-establish the endpoint's security identity.
    ///
    /// Runs the waiting states in order: identity allocation, the
    /// initial-global-identities barrier (skipped for fixed and well-known
    /// identities), the regeneration fence, then the locked commit. Each
    /// wait is preempted by the endpoint's alive signal and reports
    /// [`Error::NotAlive`].
    pub async fn restore_identity(&self, ep: &Arc<Endpoint>) -> Result<()> {
        let alive = ep.alive_token();

        // Filter the restored labels with this agent's filter; the previous
        // agent's idea of what is security relevant may be outdated.
        let identity_labels = {
            let inner = match ep.read_alive() {
                Ok(inner) => inner,
                Err(e) => {
                    warn!(
                        endpoint_id = ep.id(),
                        "Endpoint disappeared before filtering labels for restore"
                    );
                    return Err(e);
                }
            };
            let (identity_labels, _info) = self.label_filter.filter(&inner.labels().all_labels());
            identity_labels
        };

        // Allocation blocks this endpoint's restore until an identity is
        // available. The controller retries with backoff; deleting the
        // endpoint cancels the allocator call through the linked token.
        let allocated = self.spawn_allocation_controller(ep, identity_labels);
        let identity = tokio::select! {
            _ = alive.cancelled() => return Err(Error::NotAlive),
            identity = allocated => identity.map_err(|_| Error::NotAlive)?,
        };

        // Policy for a freshly restarted agent is only trustworthy once the
        // cluster-wide identity set has been synced; fixed and well-known
        // identities do not depend on it.
        if !identity.is_fixed() && !identity.is_well_known() {
            let synced = self.spawn_global_identities_controller(ep);
            tokio::select! {
                _ = alive.cancelled() => return Err(Error::NotAlive),
                synced = synced => synced.map_err(|_| Error::NotAlive)?,
            }
        }

        // Registered startup initializers must finish before any
        // regeneration.
        self.regenerator.wait_for_fence(&alive).await?;

        // A changed identity means either this agent considers different
        // labels security relevant than the one that persisted the
        // snapshot, or the restored identity came from a stale kvstore
        // view. Other nodes may not have observed the new identity yet, so
        // hold off committing it for the grace period. The sleep happens
        // before taking the lock; the commit below stays atomic.
        let previous_id = {
            let inner = ep.read_alive()?;
            inner.identity().map(|identity| identity.id)
        };
        if let Some(old_id) = previous_id {
            if old_id != identity.id {
                info!(
                    endpoint_id = ep.id(),
                    identity_old = %old_id,
                    identity_new = %identity.id,
                    "Security identity restored for the endpoint differs from its previous identity"
                );
                tokio::select! {
                    _ = alive.cancelled() => return Err(Error::NotAlive),
                    _ = tokio::time::sleep(self.config.identity_change_grace_period) => {}
                }
            }
        }

        let mut inner = match ep.lock_alive() {
            Ok(inner) => inner,
            Err(e) => {
                warn!(endpoint_id = ep.id(), "Endpoint to restore has been deleted");
                return Err(e);
            }
        };
        ep.set_state_locked(
            &mut inner,
            EndpointState::Restoring,
            "Synchronizing endpoint labels with the identity store",
        );
        // Identity-derived runtime fields are not part of the snapshot, so
        // the identity is set even when unchanged.
        inner.set_identity(identity);
        drop(inner);

        Ok(())
    }

    fn spawn_allocation_controller(
        &self,
        ep: &Arc<Endpoint>,
        labels: crate::labels::LabelSet,
    ) -> oneshot::Receiver<Identity> {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let allocator = self.allocator.clone();

        let name = restore_identity_controller_name(ep.id());
        let params =
            ControllerParams::new(RESTORE_IDENTITY_GROUP).with_cancel(ep.alive_token());
        self.controllers.update(name, params, move |cancel| {
            let allocator = allocator.clone();
            let labels = labels.clone();
            let tx = tx.clone();
            Box::pin(async move {
                let (identity, _allocated) = allocator
                    .allocate_identity(&cancel, &labels, true, IDENTITY_INVALID)
                    .await?;
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(identity);
                }
                Ok(())
            })
        });

        rx
    }

    fn spawn_global_identities_controller(&self, ep: &Arc<Endpoint>) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let allocator = self.allocator.clone();
        let endpoint_id = ep.id();

        let name = global_identities_controller_name(endpoint_id);
        let params =
            ControllerParams::new(INITIAL_GLOBAL_IDENTITIES_GROUP).with_cancel(ep.alive_token());
        self.controllers.update(name, params, move |cancel| {
            let allocator = allocator.clone();
            let tx = tx.clone();
            Box::pin(async move {
                if let Err(e) = allocator.wait_for_initial_global_identities(&cancel).await {
                    warn!(
                        endpoint_id,
                        error = %e,
                        "Failed while waiting for initial global identities"
                    );
                    return Err(e);
                }
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(());
                }
                Ok(())
            })
        });

        rx
    }
}

fn restore_identity_controller_name(id: EndpointId) -> String {
    format!("restoring-ep-identity ({id})")
}

fn global_identities_controller_name(id: EndpointId) -> String {
    format!("waiting-initial-global-identities-ep ({id})")
}
