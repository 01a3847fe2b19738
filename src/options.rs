//! Mutable datapath option registry.
//!
//! An endpoint carries an integer-valued option map controlling per-endpoint
//! datapath behavior. The set of recognized mutable options is defined by an
//! [`OptionLibrary`]; values restored from disk are re-bound to the running
//! agent's library so later validation has a registry to consult. Unknown
//! persisted keys are preserved for forward compatibility.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Registry of option names an endpoint may mutate at runtime.
#[derive(Debug, Clone, Default)]
pub struct OptionLibrary {
    known: BTreeSet<String>,
}

impl OptionLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an option name.
    pub fn with_option(mut self, name: impl Into<String>) -> Self {
        self.known.insert(name.into());
        self
    }

    /// Whether the option name is registered.
    pub fn is_known(&self, name: &str) -> bool {
        self.known.contains(name)
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

/// The endpoint-mutable option library of this agent.
pub fn endpoint_mutable_options() -> OptionLibrary {
    OptionLibrary::new()
        .with_option("ConntrackAccounting")
        .with_option("Debug")
        .with_option("DebugPolicy")
        .with_option("DropNotification")
        .with_option("TraceNotification")
        .with_option("PolicyVerdictNotification")
        .with_option("SourceIPVerification")
}

/// Integer-valued options bound to a library of recognized names.
#[derive(Debug, Clone)]
pub struct IntOptions {
    opts: BTreeMap<String, i64>,
    library: Arc<OptionLibrary>,
}

impl IntOptions {
    /// Create an empty option set bound to a library.
    pub fn new(library: Arc<OptionLibrary>) -> Self {
        Self {
            opts: BTreeMap::new(),
            library,
        }
    }

    /// Rebuild an option set from its persisted map form.
    ///
    /// Keys the library does not know are kept as-is; a snapshot written by a
    /// newer agent must stay loadable.
    pub fn restore(opts: BTreeMap<String, i64>, library: Arc<OptionLibrary>) -> Self {
        Self { opts, library }
    }

    /// Set an option value.
    pub fn set(&mut self, name: impl Into<String>, value: i64) {
        self.opts.insert(name.into(), value);
    }

    /// Current value of an option, if set.
    pub fn get(&self, name: &str) -> Option<i64> {
        self.opts.get(name).copied()
    }

    /// Whether an option is set to a non-zero value.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.get(name).unwrap_or(0) != 0
    }

    /// The persisted map form.
    pub fn as_map(&self) -> &BTreeMap<String, i64> {
        &self.opts
    }

    /// The library this option set validates against.
    pub fn library(&self) -> &OptionLibrary {
        &self.library
    }
}

impl PartialEq for IntOptions {
    fn eq(&self, other: &Self) -> bool {
        self.opts == other.opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_preserves_unknown_keys() {
        let library = Arc::new(endpoint_mutable_options());
        let mut persisted = BTreeMap::new();
        persisted.insert("Debug".to_string(), 1);
        persisted.insert("FutureOption".to_string(), 7);

        let opts = IntOptions::restore(persisted, library);
        assert!(opts.is_enabled("Debug"));
        assert_eq!(opts.get("FutureOption"), Some(7));
        assert!(!opts.library().is_known("FutureOption"));
    }

    #[test]
    fn test_mutable_library_contents() {
        let library = endpoint_mutable_options();
        assert!(library.is_known("ConntrackAccounting"));
        assert!(library.is_known("PolicyVerdictNotification"));
        assert!(!library.is_known("NotAnOption"));
    }

    #[test]
    fn test_set_get() {
        let mut opts = IntOptions::new(Arc::new(endpoint_mutable_options()));
        assert!(!opts.is_enabled("Debug"));
        opts.set("Debug", 1);
        assert!(opts.is_enabled("Debug"));
    }
}
