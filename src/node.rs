//! Node-scoped endpoint registry.

use crate::types::EndpointId;
use std::sync::OnceLock;
use tracing::warn;

/// Write-once publication of the host endpoint's id.
///
/// Restored endpoints other than the host need the host's id to wire up
/// host-reachability in their datapath configuration; the restore manager
/// publishes it here before any driver starts regeneration. Passed by `Arc`
/// to everything that needs it rather than living in a global.
#[derive(Debug, Default)]
pub struct HostEndpointRegistry {
    id: OnceLock<EndpointId>,
}

impl HostEndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the host endpoint id. Returns whether this call set it.
    pub fn publish(&self, id: EndpointId) -> bool {
        let published = self.id.set(id).is_ok();
        if !published {
            if let Some(existing) = self.id.get() {
                if *existing != id {
                    warn!(
                        existing = *existing,
                        attempted = id,
                        "Host endpoint id already published with a different value"
                    );
                }
            }
        }
        published
    }

    /// The published host endpoint id, if any.
    pub fn id(&self) -> Option<EndpointId> {
        self.id.get().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_once() {
        let registry = HostEndpointRegistry::new();
        assert_eq!(registry.id(), None);

        assert!(registry.publish(9));
        assert_eq!(registry.id(), Some(9));

        // Later publications do not overwrite.
        assert!(!registry.publish(12));
        assert_eq!(registry.id(), Some(9));
    }
}
