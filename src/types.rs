//! Core types used throughout the endpoint restore core.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Endpoint identifier, unique in the scope of one node.
pub type EndpointId = u16;

/// Numeric security identity derived from an endpoint's labels.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct IdentityId(pub u32);

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Endpoint is waiting to be built.
    Waiting,

    /// Endpoint is up and policy is enforced.
    Ready,

    /// Endpoint datapath is being rebuilt.
    Regenerating,

    /// Endpoint is being recovered after an agent restart.
    Restoring,

    /// Endpoint deletion has started.
    Disconnecting,

    /// Endpoint deletion has completed.
    Disconnected,
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointState::Waiting => write!(f, "waiting"),
            EndpointState::Ready => write!(f, "ready"),
            EndpointState::Regenerating => write!(f, "regenerating"),
            EndpointState::Restoring => write!(f, "restoring"),
            EndpointState::Disconnecting => write!(f, "disconnecting"),
            EndpointState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// A MAC address, serialized in the usual colon-separated hex form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// Create a MAC address from raw octets.
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Raw octets.
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Whether this is the all-zero (unset) address.
    pub fn is_unset(&self) -> bool {
        self.0 == [0u8; 6]
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(MacAddr::default());
        }
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(|| format!("short MAC {s:?}"))?;
            *octet =
                u8::from_str_radix(part, 16).map_err(|e| format!("invalid MAC {s:?}: {e}"))?;
        }
        if parts.next().is_some() {
            return Err(format!("long MAC {s:?}"));
        }
        Ok(MacAddr(octets))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.is_unset() {
            serializer.serialize_str("")
        } else {
            serializer.collect_str(self)
        }
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Datapath features requested by the plugin that created the endpoint.
///
/// Persisted verbatim; all fields default to off when absent from older
/// snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatapathConfiguration {
    /// Endpoint datapath must pass through ARP requests.
    #[serde(default)]
    pub require_arp_passthrough: bool,

    /// Endpoint requires an egress program attached to its interface.
    #[serde(default)]
    pub require_egress_prog: bool,

    /// Endpoint requires host-side routing to be set up.
    #[serde(default)]
    pub require_routing: Option<bool>,

    /// Addresses were allocated by an external IPAM.
    #[serde(default)]
    pub external_ipam: bool,

    /// An endpoint route must be installed on the host.
    #[serde(default)]
    pub install_endpoint_route: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_roundtrip() {
        let mac: MacAddr = "02:42:ac:11:00:02".parse().unwrap();
        assert_eq!(mac.to_string(), "02:42:ac:11:00:02");

        let json = serde_json::to_string(&mac).unwrap();
        let back: MacAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(mac, back);
    }

    #[test]
    fn test_mac_empty_string_is_unset() {
        let mac: MacAddr = serde_json::from_str("\"\"").unwrap();
        assert!(mac.is_unset());
        assert_eq!(serde_json::to_string(&mac).unwrap(), "\"\"");
    }

    #[test]
    fn test_mac_rejects_garbage() {
        assert!("zz:42:ac:11:00:02".parse::<MacAddr>().is_err());
        assert!("02:42:ac".parse::<MacAddr>().is_err());
        assert!("02:42:ac:11:00:02:03".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_endpoint_state_display() {
        assert_eq!(EndpointState::Restoring.to_string(), "restoring");
        assert_eq!(EndpointState::Disconnecting.to_string(), "disconnecting");
    }

    #[test]
    fn test_datapath_configuration_defaults() {
        let dc: DatapathConfiguration = serde_json::from_str("{}").unwrap();
        assert_eq!(dc, DatapathConfiguration::default());
        assert!(dc.require_routing.is_none());
    }
}
