//! Change operations carried by the protocol
//!
//! The protocol never looks inside a [`Change`]: it only stores it, shows its
//! summary, and hands it to the node's change applicator.

use serde::{Deserialize, Serialize};

/// Lifecycle of one change record in a node's log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeState {
    Prepared,
    Committed,
    RolledBack,
}

impl std::fmt::Display for ChangeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeState::Prepared => write!(f, "PREPARED"),
            ChangeState::Committed => write!(f, "COMMITTED"),
            ChangeState::RolledBack => write!(f, "ROLLED_BACK"),
        }
    }
}

impl std::str::FromStr for ChangeState {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "PREPARED" => Ok(ChangeState::Prepared),
            "COMMITTED" => Ok(ChangeState::Committed),
            "ROLLED_BACK" => Ok(ChangeState::RolledBack),
            other => Err(crate::Error::Corrupted(format!(
                "unknown change state: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingOperation {
    Set,
    Unset,
}

/// A proposed configuration change, keyed by a stable `type` tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Change {
    /// First change of every cluster: names it and fixes its initial members
    ClusterActivation { cluster: String, nodes: Vec<String> },
    Setting {
        operation: SettingOperation,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
    NodeAddition { node: String },
    NodeRemoval { node: String },
    /// Several changes applied as one
    Multi { changes: Vec<Change> },
}

impl Change {
    pub fn set(name: impl Into<String>, value: impl Into<String>) -> Self {
        Change::Setting {
            operation: SettingOperation::Set,
            name: name.into(),
            value: Some(value.into()),
        }
    }

    pub fn unset(name: impl Into<String>) -> Self {
        Change::Setting {
            operation: SettingOperation::Unset,
            name: name.into(),
            value: None,
        }
    }

    pub fn activation(cluster: impl Into<String>, nodes: Vec<String>) -> Self {
        Change::ClusterActivation {
            cluster: cluster.into(),
            nodes,
        }
    }

    /// Stable type tag, as written in the change log
    pub fn type_tag(&self) -> &'static str {
        match self {
            Change::ClusterActivation { .. } => "cluster-activation",
            Change::Setting { .. } => "setting",
            Change::NodeAddition { .. } => "node-addition",
            Change::NodeRemoval { .. } => "node-removal",
            Change::Multi { .. } => "multi",
        }
    }

    /// Human-readable description for operators
    pub fn summary(&self) -> String {
        match self {
            Change::ClusterActivation { cluster, nodes } => {
                format!("Activating cluster {} with nodes: {}", cluster, nodes.join(", "))
            }
            Change::Setting {
                operation: SettingOperation::Set,
                name,
                value,
            } => format!("set {}={}", name, value.as_deref().unwrap_or("")),
            Change::Setting {
                operation: SettingOperation::Unset,
                name,
                ..
            } => format!("unset {}", name),
            Change::NodeAddition { node } => format!("Attaching node {} to the cluster", node),
            Change::NodeRemoval { node } => format!("Detaching node {} from the cluster", node),
            Change::Multi { changes } => changes
                .iter()
                .map(Change::summary)
                .collect::<Vec<_>>()
                .join("; "),
        }
    }
}

impl std::fmt::Display for Change {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary() {
        assert_eq!(Change::set("offheap.main", "512MB").summary(), "set offheap.main=512MB");
        assert_eq!(Change::unset("offheap.main").summary(), "unset offheap.main");
        let multi = Change::Multi {
            changes: vec![Change::set("a", "1"), Change::unset("b")],
        };
        assert_eq!(multi.summary(), "set a=1; unset b");
    }

    #[test]
    fn test_type_tag_matches_serialized_tag() {
        let changes = vec![
            Change::activation("prod", vec!["node-1".into()]),
            Change::set("a", "1"),
            Change::NodeAddition { node: "node-2".into() },
            Change::NodeRemoval { node: "node-2".into() },
            Change::Multi { changes: vec![] },
        ];
        for change in changes {
            let json = serde_json::to_value(&change).unwrap();
            assert_eq!(json["type"], change.type_tag());
        }
    }

    #[test]
    fn test_change_state_text() {
        for state in [ChangeState::Prepared, ChangeState::Committed, ChangeState::RolledBack] {
            assert_eq!(state.to_string().parse::<ChangeState>().unwrap(), state);
            assert_eq!(
                serde_json::to_value(state).unwrap(),
                serde_json::Value::String(state.to_string())
            );
        }
        assert!("ACTIVE".parse::<ChangeState>().is_err());
    }
}
