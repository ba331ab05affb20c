//! Routing rule tables attached to a service

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Label value that matches anything, including an absent key
pub const MATCH_ALL: &str = "*";

fn default_match_type() -> String {
    "EXACT".to_string()
}

fn default_value_type() -> String {
    "TEXT".to_string()
}

fn default_weight() -> u32 {
    100
}

/// Metadata matcher on a source or destination bound
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaLabel {
    /// `EXACT` or `REGEX`; both are compared as exact text
    #[serde(rename = "type", default = "default_match_type")]
    pub match_type: String,
    #[serde(rename = "valueType", default = "default_value_type")]
    pub value_type: String,
    pub value: String,
}

impl MetaLabel {
    pub fn exact(value: impl Into<String>) -> Self {
        Self { match_type: default_match_type(), value_type: default_value_type(), value: value.into() }
    }

    pub fn matches(&self, actual: Option<&str>) -> bool {
        self.value == MATCH_ALL || actual == Some(self.value.as_str())
    }
}

/// Check every label against a flat metadata map
pub fn labels_match(labels: &HashMap<String, MetaLabel>, meta: &HashMap<String, String>) -> bool {
    labels.iter().all(|(key, label)| label.matches(meta.get(key).map(String::as_str)))
}

/// Match a rule-side name against an actual name, treating empty and `*` as wildcards
pub fn name_matches(pattern: &str, actual: &str) -> bool {
    pattern.is_empty() || pattern == MATCH_ALL || pattern == actual
}

/// Caller matcher of a routing rule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceBound {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub metadata: HashMap<String, MetaLabel>,
}

impl SourceBound {
    pub fn new(service: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { service: service.into(), namespace: namespace.into(), metadata: HashMap::new() }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), MetaLabel::exact(value));
        self
    }
}

/// Callee matcher of a routing rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationBound {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub metadata: HashMap<String, MetaLabel>,
    /// Failover tier, lower number is tried first
    #[serde(default)]
    pub priority: u32,
    /// Share of traffic relative to other destinations in the same tier
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl DestinationBound {
    pub fn new(service: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            namespace: namespace.into(),
            metadata: HashMap::new(),
            priority: 0,
            weight: default_weight(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), MetaLabel::exact(value));
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

/// One routing rule: callers matching `sources` are sent to `destinations`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingBound {
    #[serde(default)]
    pub sources: Vec<SourceBound>,
    #[serde(default)]
    pub destinations: Vec<DestinationBound>,
}

impl RoutingBound {
    pub fn new(sources: Vec<SourceBound>, destinations: Vec<DestinationBound>) -> Self {
        Self { sources, destinations }
    }

    /// Caller service name this rule is filed under; `*` when the rule has no source
    pub fn source_name(&self) -> &str {
        self.sources.first().map(|s| s.service.as_str()).filter(|s| !s.is_empty()).unwrap_or(MATCH_ALL)
    }
}

/// Routing configuration of one service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routing {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub inbounds: Vec<RoutingBound>,
    #[serde(default)]
    pub outbounds: Vec<RoutingBound>,
    #[serde(default)]
    pub ctime: String,
    #[serde(default)]
    pub mtime: String,
    #[serde(default)]
    pub revision: String,
}
