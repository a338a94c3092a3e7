//! Cluster configuration domain
//!
//! The configuration the node binary and CLI manage: a named cluster, its
//! member nodes and a flat map of settings.

pub mod applicator;

pub use applicator::ClusterConfigApplicator;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    pub nodes: Vec<String>,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    /// Number of committed changes that produced this config
    pub revision: u64,
}

impl ClusterConfig {
    pub fn new(name: impl Into<String>, nodes: Vec<String>) -> Self {
        Self {
            name: name.into(),
            nodes,
            settings: BTreeMap::new(),
            revision: 0,
        }
    }

    pub fn contains_node(&self, node: &str) -> bool {
        self.nodes.iter().any(|n| n == node)
    }

    pub fn setting(&self, name: &str) -> Option<&str> {
        self.settings.get(name).map(String::as_str)
    }
}
