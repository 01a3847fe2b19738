//! DNS resolution history carried across agent restarts.
//!
//! Endpoints doing FQDN-based policy keep two caches: the live resolution
//! history ([`DnsCache`]) and expired entries awaiting connection-tracking
//! confirmation before their datapath state may be released ([`DnsZombies`]).
//! Both are persisted in the endpoint snapshot; their size limits and TTL
//! clamps come from the running agent's configuration, not from disk, and are
//! re-bound after every restore.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// One DNS response recorded for a name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsLookup {
    /// Addresses returned by the response.
    pub ips: Vec<IpAddr>,

    /// Unix time (seconds) at which this lookup stops being valid.
    pub expires_at: u64,

    /// TTL of the original response, in seconds.
    #[serde(default)]
    pub ttl: u32,
}

/// Per-port DNS proxy rule: a match pattern plus the addresses it has
/// resolved to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsSelectorRule {
    #[serde(default)]
    pub match_pattern: String,
    #[serde(default)]
    pub ips: Vec<IpAddr>,
}

/// DNS proxy rules keyed by port.
pub type DnsRules = BTreeMap<u16, Vec<DnsSelectorRule>>;

/// DNS proxy rules keyed by `port/protocol`.
pub type DnsRulesV2 = BTreeMap<String, Vec<DnsSelectorRule>>;

/// Still-valid DNS responses intercepted for an endpoint.
///
/// Only the entries are persisted; limits are process configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsCache {
    entries: BTreeMap<String, Vec<DnsLookup>>,

    #[serde(skip)]
    min_ttl: u32,

    #[serde(skip)]
    max_ips_per_host: usize,
}

impl DnsCache {
    /// Create an empty cache with the given limits.
    pub fn new(min_ttl: u32, max_ips_per_host: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            min_ttl,
            max_ips_per_host,
        }
    }

    /// Re-bind limits after deserialization and enforce the per-host cap on
    /// restored entries.
    pub fn configure(&mut self, min_ttl: u32, max_ips_per_host: usize) {
        self.min_ttl = min_ttl;
        self.max_ips_per_host = max_ips_per_host;
        if max_ips_per_host > 0 {
            for lookups in self.entries.values_mut() {
                for lookup in lookups.iter_mut() {
                    lookup.ips.truncate(max_ips_per_host);
                }
            }
        }
    }

    /// Record a DNS response for a name. The TTL is clamped up to the
    /// configured minimum and the address list to the per-host cap.
    pub fn update(&mut self, now: u64, name: impl Into<String>, mut ips: Vec<IpAddr>, ttl: u32) {
        let ttl = ttl.max(self.min_ttl);
        if self.max_ips_per_host > 0 {
            ips.truncate(self.max_ips_per_host);
        }
        self.entries.entry(name.into()).or_default().push(DnsLookup {
            ips,
            expires_at: now + u64::from(ttl),
            ttl,
        });
    }

    /// Addresses currently valid for a name.
    pub fn lookup(&self, now: u64, name: &str) -> Vec<IpAddr> {
        let mut out = Vec::new();
        if let Some(lookups) = self.entries.get(name) {
            for lookup in lookups {
                if lookup.expires_at > now {
                    for ip in &lookup.ips {
                        if !out.contains(ip) {
                            out.push(*ip);
                        }
                    }
                }
            }
        }
        out
    }

    /// Drop expired lookups, handing their addresses to the zombie tracker.
    pub fn gc(&mut self, now: u64, zombies: &mut DnsZombies) {
        self.entries.retain(|name, lookups| {
            lookups.retain(|lookup| {
                if lookup.expires_at > now {
                    return true;
                }
                for ip in &lookup.ips {
                    zombies.upsert(now, *ip, name.clone());
                }
                false
            });
            !lookups.is_empty()
        });
    }

    /// Number of names with recorded lookups.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// Equality is over the persisted entries; limits are process configuration
// and differ between a freshly written and a restored cache.
impl PartialEq for DnsCache {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

/// An expired DNS mapping whose datapath state has not yet been confirmed
/// released by connection tracking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsZombie {
    /// Names the address was resolved from.
    pub names: Vec<String>,

    /// Unix time (seconds) at which the entry expired out of the live cache.
    pub deletion_pending_since: u64,
}

/// Expired or evicted DNS entries pending deferred deletion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsZombies {
    zombies: BTreeMap<IpAddr, DnsZombie>,

    #[serde(skip)]
    max_deferred_deletes: usize,
}

impl DnsZombies {
    /// Create an empty tracker with the given cap.
    pub fn new(max_deferred_deletes: usize) -> Self {
        Self {
            zombies: BTreeMap::new(),
            max_deferred_deletes,
        }
    }

    /// Re-bind the cap after deserialization.
    pub fn configure(&mut self, max_deferred_deletes: usize) {
        self.max_deferred_deletes = max_deferred_deletes;
    }

    /// Track an expired address. At the cap, new addresses are dropped
    /// rather than evicting older entries, which are closer to deletion.
    pub fn upsert(&mut self, now: u64, ip: IpAddr, name: String) {
        if let Some(zombie) = self.zombies.get_mut(&ip) {
            if !zombie.names.contains(&name) {
                zombie.names.push(name);
            }
            return;
        }
        if self.max_deferred_deletes > 0 && self.zombies.len() >= self.max_deferred_deletes {
            return;
        }
        self.zombies.insert(
            ip,
            DnsZombie {
                names: vec![name],
                deletion_pending_since: now,
            },
        );
    }

    /// Forget an address once connection tracking has confirmed it is gone.
    pub fn remove(&mut self, ip: &IpAddr) -> Option<DnsZombie> {
        self.zombies.remove(ip)
    }

    pub fn len(&self) -> usize {
        self.zombies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zombies.is_empty()
    }
}

impl PartialEq for DnsZombies {
    fn eq(&self, other: &Self) -> bool {
        self.zombies == other.zombies
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_update_clamps_ttl_to_minimum() {
        let mut cache = DnsCache::new(600, 10);
        cache.update(1_000, "svc.example.com", vec![ip("10.0.0.1")], 30);

        assert_eq!(cache.lookup(1_000 + 599, "svc.example.com").len(), 1);
        assert!(cache.lookup(1_000 + 601, "svc.example.com").is_empty());
    }

    #[test]
    fn test_update_caps_ips_per_host() {
        let mut cache = DnsCache::new(0, 2);
        cache.update(
            0,
            "big.example.com",
            vec![ip("10.0.0.1"), ip("10.0.0.2"), ip("10.0.0.3")],
            60,
        );
        assert_eq!(cache.lookup(1, "big.example.com").len(), 2);
    }

    #[test]
    fn test_gc_moves_expired_entries_to_zombies() {
        let mut cache = DnsCache::new(0, 10);
        let mut zombies = DnsZombies::new(100);
        cache.update(0, "old.example.com", vec![ip("10.0.0.9")], 10);
        cache.update(0, "new.example.com", vec![ip("10.0.0.8")], 1_000);

        cache.gc(500, &mut zombies);

        assert_eq!(cache.len(), 1);
        assert_eq!(zombies.len(), 1);
        let zombie = zombies.remove(&ip("10.0.0.9")).unwrap();
        assert_eq!(zombie.names, vec!["old.example.com".to_string()]);
        assert_eq!(zombie.deletion_pending_since, 500);
    }

    #[test]
    fn test_zombies_respect_deferred_delete_cap() {
        let mut zombies = DnsZombies::new(1);
        zombies.upsert(0, ip("10.0.0.1"), "a.example.com".into());
        zombies.upsert(0, ip("10.0.0.2"), "b.example.com".into());

        assert_eq!(zombies.len(), 1);
        // An existing entry still collects additional names at the cap.
        zombies.upsert(0, ip("10.0.0.1"), "alias.example.com".into());
        assert_eq!(
            zombies.remove(&ip("10.0.0.1")).unwrap().names.len(),
            2
        );
    }

    #[test]
    fn test_serde_drops_limits_and_configure_rebinds() {
        let mut cache = DnsCache::new(60, 5);
        cache.update(0, "svc.example.com", vec![ip("10.0.0.1"), ip("10.0.0.2")], 120);

        let json = serde_json::to_string(&cache).unwrap();
        let mut back: DnsCache = serde_json::from_str(&json).unwrap();

        // Entries survive; limits come from config, not disk.
        assert_eq!(back.lookup(1, "svc.example.com").len(), 2);
        back.configure(60, 1);
        assert_eq!(back.lookup(1, "svc.example.com").len(), 1);
    }

    #[test]
    fn test_zombies_serde_roundtrip() {
        let mut zombies = DnsZombies::new(10);
        zombies.upsert(42, ip("10.0.0.7"), "gone.example.com".into());

        let json = serde_json::to_string(&zombies).unwrap();
        let back: DnsZombies = serde_json::from_str(&json).unwrap();
        assert_eq!(zombies, back);
    }
}
