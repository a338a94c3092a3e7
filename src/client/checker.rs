//! Cluster-wide consistency checks over one discovery round

use std::collections::{BTreeMap, HashSet};

use uuid::Uuid;

use crate::client::results::ResultReceiver;
use crate::common::{ChangeState, DiscoverResponse};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCheck {
    Consistent,
    /// A change is committed on some nodes and rolled back on others
    Inconsistent {
        change_uuid: Uuid,
        committed_nodes: Vec<String>,
        rolled_back_nodes: Vec<String>,
    },
    /// Nodes disagree on their last committed change
    Desynchronized {
        partitions: BTreeMap<Option<Uuid>, Vec<String>>,
    },
}

/// Check `discoveries` and report any finding to `receiver`
pub fn check_cluster<T>(
    discoveries: &[(String, DiscoverResponse<T>)],
    receiver: &mut dyn ResultReceiver<T>,
) -> ClusterCheck {
    let outcome = analyze(discoveries);
    match &outcome {
        ClusterCheck::Consistent => {}
        ClusterCheck::Inconsistent {
            change_uuid,
            committed_nodes,
            rolled_back_nodes,
        } => receiver.discover_cluster_inconsistent(*change_uuid, committed_nodes, rolled_back_nodes),
        ClusterCheck::Desynchronized { partitions } => {
            receiver.discover_cluster_desynchronized(partitions)
        }
    }
    outcome
}

fn committed_uuids<T>(discovery: &DiscoverResponse<T>) -> HashSet<Uuid> {
    let mut uuids = HashSet::new();
    if let Some(uuid) = discovery.latest_committed_change_uuid() {
        uuids.insert(uuid);
    }
    if discovery.latest_change_state() == Some(ChangeState::Committed) {
        uuids.extend(discovery.latest_change_uuid());
    }
    uuids
}

fn rolled_back_uuid<T>(discovery: &DiscoverResponse<T>) -> Option<Uuid> {
    match discovery.latest_change_state() {
        Some(ChangeState::RolledBack) => discovery.latest_change_uuid(),
        _ => None,
    }
}

pub fn analyze<T>(discoveries: &[(String, DiscoverResponse<T>)]) -> ClusterCheck {
    let committed: Vec<(&str, HashSet<Uuid>)> = discoveries
        .iter()
        .map(|(node, d)| (node.as_str(), committed_uuids(d)))
        .collect();

    for (node, discovery) in discoveries {
        let uuid = match rolled_back_uuid(discovery) {
            Some(uuid) => uuid,
            None => continue,
        };
        let committed_nodes: Vec<String> = committed
            .iter()
            .filter(|(_, uuids)| uuids.contains(&uuid))
            .map(|(n, _)| n.to_string())
            .collect();
        if committed_nodes.is_empty() {
            continue;
        }
        let rolled_back_nodes: Vec<String> = discoveries
            .iter()
            .filter(|(_, d)| rolled_back_uuid(d) == Some(uuid))
            .map(|(n, _)| n.clone())
            .collect();
        tracing::debug!("Change {} rolled back on {} but committed elsewhere", uuid, node);
        return ClusterCheck::Inconsistent {
            change_uuid: uuid,
            committed_nodes,
            rolled_back_nodes,
        };
    }

    let committed_anywhere: HashSet<Uuid> = committed
        .iter()
        .flat_map(|(_, uuids)| uuids.iter().copied())
        .collect();

    // a node only missing the commit of a change committed elsewhere is
    // behind, not desynchronized
    let mut partitions: BTreeMap<Option<Uuid>, Vec<String>> = BTreeMap::new();
    for (node, discovery) in discoveries {
        let tip = match (discovery.latest_change_state(), discovery.latest_change_uuid()) {
            (Some(ChangeState::Prepared), Some(uuid)) if committed_anywhere.contains(&uuid) => {
                Some(uuid)
            }
            _ => discovery.latest_committed_change_uuid(),
        };
        partitions.entry(tip).or_default().push(node.clone());
    }

    if partitions.len() > 1 {
        return ClusterCheck::Desynchronized { partitions };
    }
    ClusterCheck::Consistent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Change, ChangeDetails, NodeMode};
    use chrono::Utc;

    fn details(uuid: Uuid, state: ChangeState) -> ChangeDetails<u64> {
        ChangeDetails {
            change_uuid: uuid,
            state,
            version: 1,
            prev_change_uuid: None,
            change: Change::set("a", "1"),
            change_result: Some(1),
            creation_host: "ops-box".into(),
            creation_user: "alice".into(),
            creation_timestamp: Utc::now(),
            change_result_hash: None,
        }
    }

    fn node(
        name: &str,
        latest: Option<ChangeDetails<u64>>,
        committed: Option<ChangeDetails<u64>>,
    ) -> (String, DiscoverResponse<u64>) {
        (
            name.to_string(),
            DiscoverResponse {
                mode: NodeMode::Accepting,
                mutative_message_count: 1,
                last_mutation_host: None,
                last_mutation_user: None,
                last_mutation_timestamp: None,
                current_version: 0,
                highest_version: 0,
                latest_change: latest,
                latest_committed_change: committed,
            },
        )
    }

    #[test]
    fn test_fresh_cluster_is_consistent() {
        let discoveries = vec![node("a", None, None), node("b", None, None)];
        assert_eq!(analyze(&discoveries), ClusterCheck::Consistent);
    }

    #[test]
    fn test_committed_and_rolled_back_is_inconsistent() {
        let uuid = Uuid::new_v4();
        let committed = details(uuid, ChangeState::Committed);
        let discoveries = vec![
            node("a", Some(committed.clone()), Some(committed)),
            node("b", Some(details(uuid, ChangeState::RolledBack)), None),
        ];
        match analyze(&discoveries) {
            ClusterCheck::Inconsistent {
                change_uuid,
                committed_nodes,
                rolled_back_nodes,
            } => {
                assert_eq!(change_uuid, uuid);
                assert_eq!(committed_nodes, vec!["a".to_string()]);
                assert_eq!(rolled_back_nodes, vec!["b".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missed_commit_is_not_desynchronized() {
        let uuid = Uuid::new_v4();
        let committed = details(uuid, ChangeState::Committed);
        let discoveries = vec![
            node("a", Some(committed.clone()), Some(committed)),
            node("b", Some(details(uuid, ChangeState::Prepared)), None),
        ];
        assert_eq!(analyze(&discoveries), ClusterCheck::Consistent);
    }

    #[test]
    fn test_different_tips_are_desynchronized() {
        let first = details(Uuid::new_v4(), ChangeState::Committed);
        let second = details(Uuid::new_v4(), ChangeState::Committed);
        let discoveries = vec![
            node("a", Some(first.clone()), Some(first)),
            node("b", Some(second.clone()), Some(second)),
            node("c", None, None),
        ];
        match analyze(&discoveries) {
            ClusterCheck::Desynchronized { partitions } => assert_eq!(partitions.len(), 3),
            other => panic!("unexpected {:?}", other),
        }
    }
}
