//! Persisted endpoint snapshot.
//!
//! WARNING - STABLE API. This structure is written as JSON to
//! `<state_dir>/<id>/endpoint_state.json` so that endpoints survive agent
//! restarts. The restore pass reads it back and rebuilds every endpoint from
//! it. Only JSON-forward-compatible modifications are allowed: fields may be
//! added (with safe defaults for older snapshots), never removed or
//! repurposed. Unknown fields written by newer agents are ignored on read.

use crate::config::AgentConfig;
use crate::endpoint::{Endpoint, EndpointInner};
use crate::error::{ParseError, Result};
use crate::fqdn::{DnsCache, DnsRules, DnsRulesV2, DnsZombies};
use crate::identity::Identity;
use crate::labels::OpLabels;
use crate::options::{IntOptions, OptionLibrary};
use crate::types::{DatapathConfiguration, EndpointId, EndpointState, MacAddr};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use uuid::Uuid;

/// Collaborator-backed context needed to turn raw snapshot bytes into a
/// usable runtime endpoint.
#[derive(Clone)]
pub struct ParseContext {
    /// Agent configuration supplying DNS cache limits.
    pub config: AgentConfig,

    /// The registry the restored option set is bound to.
    pub option_library: Arc<OptionLibrary>,
}

/// The fields of an [`Endpoint`] persisted across agent restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SerializableEndpoint {
    /// Endpoint id, unique in the scope of the node.
    pub id: EndpointId,

    /// Name given to the endpoint by the container runtime.
    #[serde(default)]
    pub container_name: String,

    /// Container id assigned by the container runtime.
    #[serde(default)]
    pub container_id: String,

    /// Network id of the runtime-managed network, if any.
    #[serde(default)]
    pub runtime_network_id: String,

    /// Endpoint id within the runtime-managed network, if any.
    #[serde(default)]
    pub runtime_endpoint_id: String,

    /// Host-facing interface name (veth peer).
    #[serde(default)]
    pub if_name: String,

    /// Interface index of the host-facing interface.
    #[serde(default)]
    pub if_index: u32,

    /// Interface index the endpoint IP is routed through, when traffic must
    /// leave via a parent interface.
    #[serde(default)]
    pub parent_if_index: u32,

    /// Container-facing interface name.
    #[serde(default)]
    pub container_if_name: String,

    /// Disables lookup by container name/id and pod name for this endpoint.
    #[serde(default)]
    pub disable_legacy_identifiers: bool,

    /// The endpoint's label configuration.
    #[serde(default)]
    pub labels: OpLabels,

    /// Container MAC address.
    #[serde(default)]
    pub mac: MacAddr,

    /// Node MAC address of the veth pair; differs per endpoint.
    #[serde(default)]
    pub node_mac: MacAddr,

    /// IPv4 address of the endpoint.
    #[serde(default)]
    pub ipv4: Option<Ipv4Addr>,

    /// Address pool the IPv4 address was allocated from.
    #[serde(default)]
    pub ipv4_pool: String,

    /// IPv6 address of the endpoint.
    #[serde(default)]
    pub ipv6: Option<Ipv6Addr>,

    /// Address pool the IPv6 address was allocated from.
    #[serde(default)]
    pub ipv6_pool: String,

    /// Security identity computed from the endpoint's labels.
    #[serde(default)]
    pub security_identity: Option<Identity>,

    /// Datapath option values, map form.
    #[serde(default)]
    pub options: BTreeMap<String, i64>,

    /// DNS proxy rules keyed by port.
    #[serde(default)]
    pub dns_rules: DnsRules,

    /// DNS proxy rules keyed by port/protocol.
    #[serde(default)]
    pub dns_rules_v2: DnsRulesV2,

    /// Still-valid DNS responses intercepted for this endpoint.
    #[serde(default)]
    pub dns_history: DnsCache,

    /// Expired or evicted DNS entries pending deferred deletion.
    #[serde(default)]
    pub dns_zombies: DnsZombies,

    /// Orchestrator pod name.
    #[serde(default)]
    pub pod_name: String,

    /// Orchestrator namespace.
    #[serde(default)]
    pub pod_namespace: String,

    /// Orchestrator pod UID.
    #[serde(default)]
    pub pod_uid: String,

    /// Datapath features requested by the plugin that created the endpoint.
    #[serde(default)]
    pub datapath_configuration: DatapathConfiguration,

    /// Unique ref of the orchestrator endpoint object this endpoint manages,
    /// kept to avoid clobbering objects owned by other endpoints.
    #[serde(default)]
    pub endpoint_uid: Option<Uuid>,

    /// Open mapping for internal per-endpoint properties. Decode default is
    /// an empty map, never absent.
    #[serde(default)]
    pub properties: HashMap<String, Value>,

    /// Network namespace cookie of the endpoint.
    #[serde(default)]
    pub netns_cookie: u64,
}

impl Endpoint {
    /// Deserialize snapshot bytes into a runtime endpoint.
    ///
    /// Fields whose raw persisted form is unusable on its own are bound to
    /// the running agent's collaborators before the endpoint is built: the
    /// option set to the mutable-option registry, the DNS caches to the
    /// configured limits. Runtime-only fields (creation time, alive token,
    /// policy readiness signal) are freshly initialized. On decode failure
    /// no endpoint is constructed.
    pub fn parse(raw: &[u8], ctx: &ParseContext) -> Result<Endpoint> {
        let restored: SerializableEndpoint =
            serde_json::from_slice(raw).map_err(ParseError::Json)?;
        Ok(Endpoint::from_snapshot(restored, ctx))
    }

    /// Build a runtime endpoint from a decoded snapshot.
    pub fn from_snapshot(restored: SerializableEndpoint, ctx: &ParseContext) -> Endpoint {
        let mut dns_history = restored.dns_history;
        dns_history.configure(ctx.config.dns_min_ttl, ctx.config.dns_max_ips_per_host);
        let mut dns_zombies = restored.dns_zombies;
        dns_zombies.configure(ctx.config.dns_max_deferred_deletes);

        let inner = EndpointInner {
            state: EndpointState::Restoring,
            container_name: restored.container_name,
            container_id: restored.container_id,
            runtime_network_id: restored.runtime_network_id,
            runtime_endpoint_id: restored.runtime_endpoint_id,
            if_name: restored.if_name,
            if_index: restored.if_index,
            parent_if_index: restored.parent_if_index,
            container_if_name: restored.container_if_name,
            disable_legacy_identifiers: restored.disable_legacy_identifiers,
            labels: restored.labels,
            mac: restored.mac,
            node_mac: restored.node_mac,
            ipv4: restored.ipv4,
            ipv4_pool: restored.ipv4_pool,
            ipv6: restored.ipv6,
            ipv6_pool: restored.ipv6_pool,
            identity: restored.security_identity,
            options: IntOptions::restore(restored.options, ctx.option_library.clone()),
            dns_rules: restored.dns_rules,
            dns_rules_v2: restored.dns_rules_v2,
            dns_history,
            dns_zombies,
            pod_name: restored.pod_name,
            pod_namespace: restored.pod_namespace,
            pod_uid: restored.pod_uid,
            datapath_configuration: restored.datapath_configuration,
            endpoint_uid: restored.endpoint_uid,
            properties: restored.properties,
            netns_cookie: restored.netns_cookie,
        };

        Endpoint::from_inner(restored.id, inner)
    }

    /// The persisted representation of this endpoint.
    pub fn snapshot(&self) -> SerializableEndpoint {
        let inner = self.inner.read();
        SerializableEndpoint {
            id: self.id(),
            container_name: inner.container_name.clone(),
            container_id: inner.container_id.clone(),
            runtime_network_id: inner.runtime_network_id.clone(),
            runtime_endpoint_id: inner.runtime_endpoint_id.clone(),
            if_name: inner.if_name.clone(),
            if_index: inner.if_index,
            parent_if_index: inner.parent_if_index,
            container_if_name: inner.container_if_name.clone(),
            disable_legacy_identifiers: inner.disable_legacy_identifiers,
            labels: inner.labels.clone(),
            mac: inner.mac,
            node_mac: inner.node_mac,
            ipv4: inner.ipv4,
            ipv4_pool: inner.ipv4_pool.clone(),
            ipv6: inner.ipv6,
            ipv6_pool: inner.ipv6_pool.clone(),
            security_identity: inner.identity.clone(),
            options: inner.options.as_map().clone(),
            dns_rules: inner.dns_rules.clone(),
            dns_rules_v2: inner.dns_rules_v2.clone(),
            dns_history: inner.dns_history.clone(),
            dns_zombies: inner.dns_zombies.clone(),
            pod_name: inner.pod_name.clone(),
            pod_namespace: inner.pod_namespace.clone(),
            pod_uid: inner.pod_uid.clone(),
            datapath_configuration: inner.datapath_configuration.clone(),
            endpoint_uid: inner.endpoint_uid,
            properties: inner.properties.clone(),
            netns_cookie: inner.netns_cookie,
        }
    }

    /// Serialize the endpoint to its on-disk JSON form.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(&self.snapshot()).map_err(ParseError::Json)?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::labels::{Label, SOURCE_CONTAINER, SOURCE_ORCHESTRATOR};
    use crate::options::endpoint_mutable_options;
    use crate::types::IdentityId;
    use std::time::SystemTime;

    fn ctx() -> ParseContext {
        ParseContext {
            config: AgentConfig::new("/tmp/netwarden-test")
                .with_dns_min_ttl(60)
                .with_dns_max_ips_per_host(4),
            option_library: Arc::new(endpoint_mutable_options()),
        }
    }

    fn sample_snapshot() -> SerializableEndpoint {
        let mut snapshot = SerializableEndpoint::default();
        snapshot.id = 23;
        snapshot.container_name = "web-0".into();
        snapshot.container_id = "cafe0123".into();
        snapshot.if_name = "wdn23".into();
        snapshot.if_index = 14;
        snapshot.container_if_name = "eth0".into();
        snapshot.mac = "02:42:ac:11:00:17".parse().unwrap();
        snapshot.node_mac = "02:42:ac:11:00:18".parse().unwrap();
        snapshot.ipv4 = Some("10.16.3.7".parse().unwrap());
        snapshot.ipv4_pool = "default".into();
        snapshot.ipv6 = Some("fd00::1707".parse().unwrap());
        snapshot
            .labels
            .orchestration_identity
            .insert(Label::new(SOURCE_ORCHESTRATOR, "app", "web"));
        snapshot
            .labels
            .custom
            .insert(Label::new(SOURCE_CONTAINER, "tier", "frontend"));
        snapshot.security_identity = Some(Identity::new(IdentityId(51234), Default::default()));
        snapshot.options.insert("Debug".into(), 1);
        snapshot.pod_name = "web-0".into();
        snapshot.pod_namespace = "default".into();
        snapshot.endpoint_uid = Some(Uuid::new_v4());
        snapshot
            .properties
            .insert("internal.skip-gc".into(), Value::Bool(true));
        snapshot.netns_cookie = 77;
        snapshot
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_persisted_fields() {
        let original = sample_snapshot();
        let raw = serde_json::to_vec(&original).unwrap();

        let ep = Endpoint::parse(&raw, &ctx()).unwrap();
        let reencoded = ep.snapshot();

        assert_eq!(original, reencoded);
    }

    #[test]
    fn test_runtime_fields_are_fresh_not_copied() {
        let raw = serde_json::to_vec(&sample_snapshot()).unwrap();
        let before = SystemTime::now();

        let ep = Endpoint::parse(&raw, &ctx()).unwrap();

        assert!(ep.created_at() >= before);
        assert!(ep.is_alive());
        assert!(!ep.initial_policy_computed());
        assert_eq!(ep.state(), EndpointState::Restoring);
    }

    #[test]
    fn test_missing_properties_decodes_to_empty_map() {
        let mut value = serde_json::to_value(sample_snapshot()).unwrap();
        value.as_object_mut().unwrap().remove("properties");
        let raw = serde_json::to_vec(&value).unwrap();

        let ep = Endpoint::parse(&raw, &ctx()).unwrap();
        let inner = ep.read_alive().unwrap();
        assert!(inner.properties().is_empty());
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let mut value = serde_json::to_value(sample_snapshot()).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("field_from_the_future".into(), Value::from(123));
        let raw = serde_json::to_vec(&value).unwrap();

        assert!(Endpoint::parse(&raw, &ctx()).is_ok());
    }

    #[test]
    fn test_minimal_snapshot_takes_defaults() {
        let ep = Endpoint::parse(br#"{"id": 3}"#, &ctx()).unwrap();
        let inner = ep.read_alive().unwrap();

        assert_eq!(ep.id(), 3);
        assert!(inner.ipv4().is_none());
        assert!(inner.identity().is_none());
        assert!(inner.dns_history().is_empty());
        assert!(inner.properties().is_empty());
        assert!(!ep.is_host());
    }

    #[test]
    fn test_malformed_bytes_fail_without_constructing() {
        let err = Endpoint::parse(b"{not json", &ctx()).unwrap_err();
        assert!(matches!(err, crate::error::Error::Parse(_)));
    }

    #[test]
    fn test_host_label_marks_host_endpoint() {
        let mut snapshot = SerializableEndpoint::default();
        snapshot.id = 1;
        snapshot.labels.orchestration_identity.insert(Label::host());

        let ep = Endpoint::from_snapshot(snapshot, &ctx());
        assert!(ep.is_host());
    }

    #[test]
    fn test_options_rebound_to_library() {
        let raw = serde_json::to_vec(&sample_snapshot()).unwrap();
        let ep = Endpoint::parse(&raw, &ctx()).unwrap();
        let inner = ep.read_alive().unwrap();

        assert!(inner.options().is_enabled("Debug"));
        assert!(inner.options().library().is_known("Debug"));
    }

    #[test]
    fn test_dns_limits_come_from_config_not_disk() {
        let mut snapshot = sample_snapshot();
        // Write more IPs than the restoring agent allows per host.
        let mut history = DnsCache::new(0, 100);
        history.update(
            0,
            "svc.example.com",
            vec![
                "10.0.0.1".parse().unwrap(),
                "10.0.0.2".parse().unwrap(),
                "10.0.0.3".parse().unwrap(),
                "10.0.0.4".parse().unwrap(),
                "10.0.0.5".parse().unwrap(),
                "10.0.0.6".parse().unwrap(),
            ],
            600,
        );
        snapshot.dns_history = history;
        let raw = serde_json::to_vec(&snapshot).unwrap();

        // ctx() caps at 4 IPs per host.
        let ep = Endpoint::parse(&raw, &ctx()).unwrap();
        let inner = ep.read_alive().unwrap();
        assert_eq!(inner.dns_history().lookup(1, "svc.example.com").len(), 4);
    }
}
