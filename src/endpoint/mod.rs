//! The runtime endpoint object.
//!
//! An [`Endpoint`] is one managed network attachment point. Everything that
//! is persisted across agent restarts lives behind a single read/write lock;
//! process-lifetime-only state (creation time, the alive cancellation token,
//! the initial-policy readiness signal) is rebuilt on every restore. The
//! alive token is the one cancellation signal every blocking restore step
//! races against.

mod snapshot;

pub use snapshot::{ParseContext, SerializableEndpoint};

use crate::error::{Error, Result};
use crate::fqdn::{DnsCache, DnsRules, DnsRulesV2, DnsZombies};
use crate::identity::Identity;
use crate::labels::OpLabels;
use crate::options::IntOptions;
use crate::types::{DatapathConfiguration, EndpointId, EndpointState, MacAddr};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde_json::Value;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Mutable endpoint state, guarded by the endpoint's lock.
#[derive(Debug)]
pub struct EndpointInner {
    pub(crate) state: EndpointState,
    pub(crate) container_name: String,
    pub(crate) container_id: String,
    pub(crate) runtime_network_id: String,
    pub(crate) runtime_endpoint_id: String,
    pub(crate) if_name: String,
    pub(crate) if_index: u32,
    pub(crate) parent_if_index: u32,
    pub(crate) container_if_name: String,
    pub(crate) disable_legacy_identifiers: bool,
    pub(crate) labels: OpLabels,
    pub(crate) mac: MacAddr,
    pub(crate) node_mac: MacAddr,
    pub(crate) ipv4: Option<Ipv4Addr>,
    pub(crate) ipv4_pool: String,
    pub(crate) ipv6: Option<Ipv6Addr>,
    pub(crate) ipv6_pool: String,
    pub(crate) identity: Option<Identity>,
    pub(crate) options: IntOptions,
    pub(crate) dns_rules: DnsRules,
    pub(crate) dns_rules_v2: DnsRulesV2,
    pub(crate) dns_history: DnsCache,
    pub(crate) dns_zombies: DnsZombies,
    pub(crate) pod_name: String,
    pub(crate) pod_namespace: String,
    pub(crate) pod_uid: String,
    pub(crate) datapath_configuration: DatapathConfiguration,
    pub(crate) endpoint_uid: Option<Uuid>,
    pub(crate) properties: HashMap<String, Value>,
    pub(crate) netns_cookie: u64,
}

impl EndpointInner {
    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn labels(&self) -> &OpLabels {
        &self.labels
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub(crate) fn set_identity(&mut self, identity: Identity) {
        self.identity = Some(identity);
    }

    pub fn if_name(&self) -> &str {
        &self.if_name
    }

    pub fn if_index(&self) -> u32 {
        self.if_index
    }

    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.ipv4
    }

    pub fn ipv6(&self) -> Option<Ipv6Addr> {
        self.ipv6
    }

    pub fn options(&self) -> &IntOptions {
        &self.options
    }

    pub fn dns_history(&self) -> &DnsCache {
        &self.dns_history
    }

    pub fn dns_zombies(&self) -> &DnsZombies {
        &self.dns_zombies
    }

    pub fn properties(&self) -> &HashMap<String, Value> {
        &self.properties
    }

    pub fn pod_name(&self) -> &str {
        &self.pod_name
    }

    pub fn pod_namespace(&self) -> &str {
        &self.pod_namespace
    }

    pub fn netns_cookie(&self) -> u64 {
        self.netns_cookie
    }
}

/// A live endpoint tracked by the agent.
pub struct Endpoint {
    id: EndpointId,
    is_host: bool,
    created_at: SystemTime,
    alive: CancellationToken,
    initial_policy_computed: watch::Sender<bool>,
    inner: RwLock<EndpointInner>,
}

impl Endpoint {
    pub(crate) fn from_inner(id: EndpointId, inner: EndpointInner) -> Self {
        let is_host = inner.labels.is_host();
        let (initial_policy_computed, _) = watch::channel(false);
        Self {
            id,
            is_host,
            created_at: SystemTime::now(),
            alive: CancellationToken::new(),
            initial_policy_computed,
            inner: RwLock::new(inner),
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// Whether this endpoint represents the host itself.
    pub fn is_host(&self) -> bool {
        self.is_host
    }

    /// When this runtime object was created (the restore time, not the
    /// original endpoint creation).
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// The signal that fires when the endpoint is deleted.
    pub fn alive_token(&self) -> CancellationToken {
        self.alive.clone()
    }

    pub fn is_alive(&self) -> bool {
        !self.alive.is_cancelled()
    }

    /// Acquire the endpoint's lock exclusively, failing if the endpoint is
    /// no longer alive.
    pub fn lock_alive(&self) -> Result<RwLockWriteGuard<'_, EndpointInner>> {
        if self.alive.is_cancelled() {
            return Err(Error::NotAlive);
        }
        Ok(self.inner.write())
    }

    /// Acquire the endpoint's lock shared, failing if the endpoint is no
    /// longer alive.
    pub fn read_alive(&self) -> Result<RwLockReadGuard<'_, EndpointInner>> {
        if self.alive.is_cancelled() {
            return Err(Error::NotAlive);
        }
        Ok(self.inner.read())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EndpointState {
        self.inner.read().state
    }

    pub(crate) fn set_state_locked(
        &self,
        inner: &mut EndpointInner,
        state: EndpointState,
        reason: &str,
    ) {
        debug!(
            endpoint_id = self.id,
            from = %inner.state,
            to = %state,
            reason,
            "Endpoint state transition"
        );
        inner.state = state;
    }

    /// Current security identity, if committed.
    pub fn identity(&self) -> Option<Identity> {
        self.inner.read().identity.clone()
    }

    /// IPv4 address for logging.
    pub fn ipv4_address(&self) -> Option<Ipv4Addr> {
        self.inner.read().ipv4
    }

    /// IPv6 address for logging.
    pub fn ipv6_address(&self) -> Option<Ipv6Addr> {
        self.inner.read().ipv6
    }

    /// The canonical on-disk directory for this endpoint under `base`.
    pub fn directory_path(&self, base: &Path) -> PathBuf {
        base.join(self.id.to_string())
    }

    /// Signal that the first policy computation for this endpoint is done.
    pub fn mark_initial_policy_computed(&self) {
        self.initial_policy_computed.send_replace(true);
    }

    /// Whether the initial policy computation has been signalled.
    pub fn initial_policy_computed(&self) -> bool {
        *self.initial_policy_computed.borrow()
    }

    /// Wait for the initial policy computation, preempted by deletion.
    pub async fn wait_initial_policy_computed(&self) -> Result<()> {
        let mut rx = self.initial_policy_computed.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = self.alive.cancelled() => return Err(Error::NotAlive),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(Error::NotAlive);
                    }
                }
            }
        }
    }

    /// Begin tearing the endpoint down: flips the lifecycle state and fires
    /// the alive signal so that in-flight restore work aborts.
    pub fn start_disconnecting(&self) {
        {
            let mut inner = self.inner.write();
            self.set_state_locked(&mut inner, EndpointState::Disconnecting, "Deleting endpoint");
        }
        self.alive.cancel();
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("is_host", &self.is_host)
            .field("state", &self.state())
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::labels::{Label, LabelSet, SOURCE_ORCHESTRATOR};
    use crate::options::endpoint_mutable_options;
    use std::sync::Arc;

    pub(crate) fn test_parse_context() -> ParseContext {
        ParseContext {
            config: AgentConfig::new("/tmp/netwarden-test"),
            option_library: Arc::new(endpoint_mutable_options()),
        }
    }

    pub(crate) fn test_endpoint(id: EndpointId) -> Endpoint {
        let mut snapshot = SerializableEndpoint::default();
        snapshot.id = id;
        snapshot.if_name = format!("wdn{id}");
        snapshot.labels.orchestration_identity = LabelSet::from_iter([Label::new(
            SOURCE_ORCHESTRATOR,
            "app",
            "web",
        )]);
        Endpoint::parse(
            &serde_json::to_vec(&snapshot).unwrap(),
            &test_parse_context(),
        )
        .unwrap()
    }

    #[test]
    fn test_lock_alive_fails_after_disconnect() {
        let ep = test_endpoint(5);
        assert!(ep.lock_alive().is_ok());
        assert!(ep.read_alive().is_ok());

        ep.start_disconnecting();

        assert!(ep.lock_alive().unwrap_err().is_not_alive());
        assert!(ep.read_alive().unwrap_err().is_not_alive());
        assert_eq!(ep.state(), EndpointState::Disconnecting);
    }

    #[test]
    fn test_directory_path_uses_id() {
        let ep = test_endpoint(42);
        assert_eq!(
            ep.directory_path(Path::new("/var/run/netwarden")),
            PathBuf::from("/var/run/netwarden/42")
        );
    }

    #[tokio::test]
    async fn test_initial_policy_signal() {
        let ep = test_endpoint(7);
        assert!(!ep.initial_policy_computed());

        ep.mark_initial_policy_computed();
        ep.wait_initial_policy_computed().await.unwrap();
        assert!(ep.initial_policy_computed());
    }

    #[tokio::test]
    async fn test_initial_policy_wait_aborts_on_delete() {
        let ep = Arc::new(test_endpoint(7));
        let waiter = {
            let ep = ep.clone();
            tokio::spawn(async move { ep.wait_initial_policy_computed().await })
        };
        tokio::task::yield_now().await;
        ep.start_disconnecting();
        assert!(waiter.await.unwrap().unwrap_err().is_not_alive());
    }
}
