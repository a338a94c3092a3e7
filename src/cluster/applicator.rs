//! Change applicator for [`ClusterConfig`]

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use crate::cluster::ClusterConfig;
use crate::common::{Change, Error, Result, SettingOperation};
use crate::node::{ChangeApplicator, PotentialApplicationResult};

/// Validates cluster changes and keeps a live runtime view of the committed config
#[derive(Clone)]
pub struct ClusterConfigApplicator {
    node_name: String,
    runtime: Arc<RwLock<Option<ClusterConfig>>>,
}

impl ClusterConfigApplicator {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            runtime: Arc::new(RwLock::new(None)),
        }
    }

    /// Seed the runtime view, usually with the latest committed config
    pub fn with_runtime(self, config: Option<ClusterConfig>) -> Self {
        self.set_runtime(config);
        self
    }

    pub fn set_runtime(&self, config: Option<ClusterConfig>) {
        if let Ok(mut runtime) = self.runtime.write() {
            *runtime = config;
        }
    }

    /// Config currently in effect on this node
    pub fn runtime(&self) -> Option<ClusterConfig> {
        self.runtime.read().ok().and_then(|runtime| runtime.clone())
    }

    fn evaluate(
        &self,
        existing: Option<&ClusterConfig>,
        change: &Change,
    ) -> std::result::Result<ClusterConfig, String> {
        let mut next = self.step(existing, change)?;
        next.revision = existing.map_or(0, |c| c.revision) + 1;
        Ok(next)
    }

    fn step(
        &self,
        existing: Option<&ClusterConfig>,
        change: &Change,
    ) -> std::result::Result<ClusterConfig, String> {
        match (existing, change) {
            (Some(config), Change::ClusterActivation { .. }) => Err(format!(
                "Node {} is already part of cluster {}",
                self.node_name, config.name
            )),
            (None, Change::ClusterActivation { cluster, nodes }) => self.activate(cluster, nodes),
            (Some(config), change) => self.edit(config.clone(), change),
            (None, change) => Err(format!(
                "Node {} is not activated: {} is not allowed",
                self.node_name,
                change.summary()
            )),
        }
    }

    fn activate(
        &self,
        cluster: &str,
        nodes: &[String],
    ) -> std::result::Result<ClusterConfig, String> {
        if cluster.trim().is_empty() {
            return Err("Cluster name must not be empty".into());
        }
        if nodes.is_empty() {
            return Err("A cluster needs at least one node".into());
        }
        let mut seen = HashSet::new();
        if let Some(duplicate) = nodes.iter().find(|n| !seen.insert(n.as_str())) {
            return Err(format!("Node {} is listed twice", duplicate));
        }
        if !nodes.contains(&self.node_name) {
            return Err(format!(
                "Node {} is not part of the activated nodes",
                self.node_name
            ));
        }
        Ok(ClusterConfig::new(cluster, nodes.to_vec()))
    }

    fn edit(
        &self,
        mut next: ClusterConfig,
        change: &Change,
    ) -> std::result::Result<ClusterConfig, String> {
        match change {
            Change::ClusterActivation { .. } => {
                return self.step(Some(&next), change);
            }
            Change::Setting {
                operation: SettingOperation::Set,
                name,
                value,
            } => {
                if name.trim().is_empty() {
                    return Err("Setting name must not be empty".into());
                }
                let value = value
                    .as_ref()
                    .ok_or_else(|| format!("Setting {} needs a value", name))?;
                next.settings.insert(name.clone(), value.clone());
            }
            Change::Setting {
                operation: SettingOperation::Unset,
                name,
                ..
            } => {
                if next.settings.remove(name).is_none() {
                    return Err(format!("Setting {} is not set", name));
                }
            }
            Change::NodeAddition { node } => {
                if next.contains_node(node) {
                    return Err(format!("Node {} is already in the cluster", node));
                }
                next.nodes.push(node.clone());
            }
            Change::NodeRemoval { node } => {
                if !next.contains_node(node) {
                    return Err(format!("Node {} is not in the cluster", node));
                }
                if next.nodes.len() == 1 {
                    return Err(format!("Cannot detach {}, the last node", node));
                }
                next.nodes.retain(|n| n != node);
            }
            Change::Multi { changes } => {
                for inner in changes {
                    next = self.step(Some(&next), inner)?;
                }
            }
        }
        Ok(next)
    }
}

impl ChangeApplicator<ClusterConfig> for ClusterConfigApplicator {
    fn try_apply(
        &self,
        existing: Option<&ClusterConfig>,
        change: &Change,
    ) -> PotentialApplicationResult<ClusterConfig> {
        match self.evaluate(existing, change) {
            Ok(config) => PotentialApplicationResult::allow(config),
            Err(reason) => PotentialApplicationResult::reject(reason),
        }
    }

    fn apply(&self, change: &Change) -> Result<()> {
        let mut runtime = self
            .runtime
            .write()
            .map_err(|_| Error::Internal("runtime config lock poisoned".into()))?;
        let next = self
            .evaluate(runtime.as_ref(), change)
            .map_err(Error::ApplyFailed)?;
        tracing::info!(
            "Applied on {}: {} (revision {})",
            self.node_name,
            change.summary(),
            next.revision
        );
        *runtime = Some(next);
        Ok(())
    }
}
