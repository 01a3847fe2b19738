//! Endpoint label model and the label-filter seam.
//!
//! Labels carry a source so that policy can distinguish where a label came
//! from (container runtime, orchestrator, reserved). The filter deciding
//! which labels are security relevant is an external collaborator; only its
//! contract lives here.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label attached by the container runtime.
pub const SOURCE_CONTAINER: &str = "container";

/// Label sourced from the orchestration control plane.
pub const SOURCE_ORCHESTRATOR: &str = "orchestrator";

/// Label reserved by the agent itself.
pub const SOURCE_RESERVED: &str = "reserved";

/// Label with no known source.
pub const SOURCE_UNSPEC: &str = "unspec";

/// Reserved label key marking the host endpoint.
pub const HOST_LABEL_KEY: &str = "host";

/// A single key/value label with its source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub source: String,
}

impl Label {
    /// Create a new label.
    pub fn new(
        source: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            source: source.into(),
        }
    }

    /// The reserved label identifying the host endpoint.
    pub fn host() -> Self {
        Label::new(SOURCE_RESERVED, HOST_LABEL_KEY, "")
    }

    /// The `source:key` form used as the map key within a [`LabelSet`].
    pub fn source_key(&self) -> String {
        format!("{}:{}", self.source, self.key)
    }
}

/// An ordered set of labels, keyed by `source:key`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeMap<String, Label>);

impl LabelSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a label, replacing any previous label with the same source:key.
    pub fn insert(&mut self, label: Label) {
        self.0.insert(label.source_key(), label);
    }

    /// Look up a label by its `source:key` form.
    pub fn get(&self, source_key: &str) -> Option<&Label> {
        self.0.get(source_key)
    }

    /// Whether a label with the given `source:key` is present.
    pub fn contains(&self, source_key: &str) -> bool {
        self.0.contains_key(source_key)
    }

    /// Merge another set into this one.
    pub fn merge(&mut self, other: &LabelSet) {
        for label in other.iter() {
            self.insert(label.clone());
        }
    }

    /// Iterate over the labels in key order.
    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A stable string form of the whole set, used as an allocation key.
    pub fn sorted_key(&self) -> String {
        let mut out = String::new();
        for label in self.0.values() {
            out.push_str(&label.source_key());
            out.push('=');
            out.push_str(&label.value);
            out.push(';');
        }
        out
    }
}

impl FromIterator<Label> for LabelSet {
    fn from_iter<T: IntoIterator<Item = Label>>(iter: T) -> Self {
        let mut set = LabelSet::new();
        for label in iter {
            set.insert(label);
        }
        set
    }
}

/// The endpoint's operational label configuration, partitioned by provenance
/// and whether the label currently participates in identity derivation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpLabels {
    /// Labels set via the local API.
    #[serde(default)]
    pub custom: LabelSet,

    /// Orchestrator labels that contribute to the security identity.
    #[serde(default)]
    pub orchestration_identity: LabelSet,

    /// Orchestrator labels kept for information only.
    #[serde(default)]
    pub orchestration_info: LabelSet,

    /// Labels explicitly disabled by the operator.
    #[serde(default)]
    pub disabled: LabelSet,
}

impl OpLabels {
    pub fn new() -> Self {
        Self::default()
    }

    /// All labels stored on the endpoint, including disabled ones.
    pub fn all_labels(&self) -> LabelSet {
        let mut all = LabelSet::new();
        all.merge(&self.custom);
        all.merge(&self.orchestration_identity);
        all.merge(&self.orchestration_info);
        all.merge(&self.disabled);
        all
    }

    /// Labels currently contributing to the security identity.
    pub fn identity_labels(&self) -> LabelSet {
        let mut set = LabelSet::new();
        set.merge(&self.custom);
        set.merge(&self.orchestration_identity);
        set
    }

    /// Whether the reserved host label is present.
    pub fn is_host(&self) -> bool {
        let key = format!("{SOURCE_RESERVED}:{HOST_LABEL_KEY}");
        self.orchestration_identity.contains(&key) || self.custom.contains(&key)
    }
}

/// Splits a label set into identity-relevant and informational labels.
///
/// The actual filtering policy is owned by the agent's policy layer; restore
/// only needs the split.
pub trait LabelFilter: Send + Sync {
    fn filter(&self, labels: &LabelSet) -> (LabelSet, LabelSet);
}

/// Filter that demotes labels whose key starts with a configured prefix to
/// informational, keeping everything else identity relevant.
#[derive(Debug, Clone, Default)]
pub struct PrefixLabelFilter {
    info_prefixes: Vec<String>,
}

impl PrefixLabelFilter {
    pub fn new(info_prefixes: Vec<String>) -> Self {
        Self { info_prefixes }
    }
}

impl LabelFilter for PrefixLabelFilter {
    fn filter(&self, labels: &LabelSet) -> (LabelSet, LabelSet) {
        let mut identity = LabelSet::new();
        let mut info = LabelSet::new();
        for label in labels.iter() {
            if self
                .info_prefixes
                .iter()
                .any(|p| label.key.starts_with(p.as_str()))
            {
                info.insert(label.clone());
            } else {
                identity.insert(label.clone());
            }
        }
        (identity, info)
    }
}
