//! Diagnostic view of the cluster built from one discovery round

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use uuid::Uuid;

use crate::client::results::ResultReceiver;
use crate::common::{ChangeState, DiscoverResponse, Error, NodeMode};
use crate::node::ConfigSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GlobalState {
    Accepting,
    Prepared,

    Inconsistent,
    Desynchronized,
    ConcurrentAccess,
    DiscoveryFailure,

    PartiallyPrepared,
    PartiallyCommitted,
    PartiallyRolledBack,
    Unknown,

    MaybePartiallyCommitted,
    MaybePartiallyRolledBack,
    MaybePrepared,
    MaybeUnknown,
}

impl std::fmt::Display for GlobalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GlobalState::Accepting => "ACCEPTING",
            GlobalState::Prepared => "PREPARED",
            GlobalState::Inconsistent => "INCONSISTENT",
            GlobalState::Desynchronized => "DESYNCHRONIZED",
            GlobalState::ConcurrentAccess => "CONCURRENT_ACCESS",
            GlobalState::DiscoveryFailure => "DISCOVERY_FAILURE",
            GlobalState::PartiallyPrepared => "PARTIALLY_PREPARED",
            GlobalState::PartiallyCommitted => "PARTIALLY_COMMITTED",
            GlobalState::PartiallyRolledBack => "PARTIALLY_ROLLED_BACK",
            GlobalState::Unknown => "UNKNOWN",
            GlobalState::MaybePartiallyCommitted => "MAYBE_PARTIALLY_COMMITTED",
            GlobalState::MaybePartiallyRolledBack => "MAYBE_PARTIALLY_ROLLED_BACK",
            GlobalState::MaybePrepared => "MAYBE_PREPARED",
            GlobalState::MaybeUnknown => "MAYBE_UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Collects discovery results and classifies the cluster.
///
/// Unreachable nodes (timeouts, refused connections) only make the verdict
/// uncertain. Any other discovery error is a `DISCOVERY_FAILURE`.
#[derive(Debug)]
pub struct ConsistencyAnalyzer<T> {
    nodes: Vec<String>,
    responses: Vec<(String, DiscoverResponse<T>)>,
    unreachable: Vec<String>,
    discover_failure: Option<String>,
    inconsistent_change: Option<Uuid>,
    desynchronized: Option<BTreeMap<Option<Uuid>, Vec<String>>>,
    other_client: Option<(String, String, String)>,
}

impl<T> ConsistencyAnalyzer<T> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            responses: Vec::new(),
            unreachable: Vec::new(),
            discover_failure: None,
            inconsistent_change: None,
            desynchronized: None,
            other_client: None,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn responses(&self) -> &[(String, DiscoverResponse<T>)] {
        &self.responses
    }

    pub fn response(&self, node: &str) -> Option<&DiscoverResponse<T>> {
        self.responses
            .iter()
            .find(|(n, _)| n == node)
            .map(|(_, r)| r)
    }

    pub fn unreachable(&self) -> &[String] {
        &self.unreachable
    }

    pub fn has_unreachable_nodes(&self) -> bool {
        self.node_count() > self.responses.len()
    }

    pub fn discover_failure(&self) -> Option<&str> {
        self.discover_failure.as_deref()
    }

    pub fn inconsistent_change(&self) -> Option<Uuid> {
        self.inconsistent_change
    }

    /// Node, host and user of the concurrent client, if one was seen
    pub fn other_client(&self) -> Option<(&str, &str, &str)> {
        self.other_client
            .as_ref()
            .map(|(n, h, u)| (n.as_str(), h.as_str(), u.as_str()))
    }

    pub fn global_state(&self) -> GlobalState {
        if self.discover_failure.is_some() {
            return GlobalState::DiscoveryFailure;
        }
        if self.inconsistent_change.is_some() {
            return GlobalState::Inconsistent;
        }
        if self.desynchronized.is_some() {
            return GlobalState::Desynchronized;
        }
        if self.other_client.is_some() {
            return GlobalState::ConcurrentAccess;
        }

        let all_accepting = self
            .responses
            .iter()
            .all(|(_, r)| r.mode == NodeMode::Accepting);
        if all_accepting {
            return GlobalState::Accepting;
        }

        let latest: Vec<(Uuid, ChangeState)> = self
            .responses
            .iter()
            .filter_map(|(_, r)| r.latest_change.as_ref())
            .map(|c| (c.change_uuid, c.state))
            .collect();
        let uuids = latest.iter().map(|(u, _)| *u).collect::<HashSet<_>>().len();
        let count = |state: ChangeState| latest.iter().filter(|(_, s)| *s == state).count();
        let prepared = count(ChangeState::Prepared);
        let committed = count(ChangeState::Committed);
        let rolled_back = count(ChangeState::RolledBack);

        let everyone = self.node_count();
        let certain = !self.has_unreachable_nodes();

        if uuids == 1 && rolled_back == 0 && committed == 0 && prepared > 0 {
            return if certain && prepared >= everyone {
                GlobalState::Prepared
            } else {
                GlobalState::MaybePrepared
            };
        }
        if uuids > 1 && prepared > 0 {
            return GlobalState::PartiallyPrepared;
        }
        if uuids > 1 {
            return GlobalState::Desynchronized;
        }
        if uuids == 1 && rolled_back == 0 && committed > 0 && prepared > 0 {
            return if certain && prepared + committed >= everyone {
                GlobalState::PartiallyCommitted
            } else {
                GlobalState::MaybePartiallyCommitted
            };
        }
        if uuids == 1 && rolled_back > 0 && committed == 0 && prepared > 0 {
            return if certain && prepared + rolled_back >= everyone {
                GlobalState::PartiallyRolledBack
            } else {
                GlobalState::MaybePartiallyRolledBack
            };
        }

        if certain {
            GlobalState::Unknown
        } else {
            GlobalState::MaybeUnknown
        }
    }
}

impl<T> Default for ConsistencyAnalyzer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ConfigSnapshot> ResultReceiver<T> for ConsistencyAnalyzer<T> {
    fn start_discovery(&mut self, nodes: &[String]) {
        self.nodes = nodes.to_vec();
    }

    fn discovered(&mut self, node: &str, discovery: &DiscoverResponse<T>) {
        self.responses.push((node.to_string(), discovery.clone()));
    }

    fn discover_fail(&mut self, node: &str, reason: &Error) {
        if reason.is_unreachable() {
            self.unreachable.push(node.to_string());
        } else {
            self.discover_failure = Some(format!("{}: {}", node, reason));
        }
    }

    fn discover_cluster_inconsistent(
        &mut self,
        change_uuid: Uuid,
        _committed_nodes: &[String],
        _rolled_back_nodes: &[String],
    ) {
        self.inconsistent_change = Some(change_uuid);
    }

    fn discover_cluster_desynchronized(&mut self, partitions: &BTreeMap<Option<Uuid>, Vec<String>>) {
        self.desynchronized = Some(partitions.clone());
    }

    fn discover_other_client(&mut self, node: &str, last_mutation_host: &str, last_mutation_user: &str) {
        self.other_client = Some((
            node.to_string(),
            last_mutation_host.to_string(),
            last_mutation_user.to_string(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Change, ChangeDetails};
    use chrono::Utc;

    fn response(latest: Option<(Uuid, ChangeState)>) -> DiscoverResponse<u64> {
        let mode = match latest {
            Some((_, ChangeState::Prepared)) => NodeMode::Prepared,
            _ => NodeMode::Accepting,
        };
        DiscoverResponse {
            mode,
            mutative_message_count: 2,
            last_mutation_host: Some("ops-box".into()),
            last_mutation_user: Some("alice".into()),
            last_mutation_timestamp: Some(Utc::now()),
            current_version: 0,
            highest_version: 1,
            latest_change: latest.map(|(uuid, state)| ChangeDetails {
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
            }),
            latest_committed_change: None,
        }
    }

    fn analyzer(states: &[Option<(Uuid, ChangeState)>], unreachable: usize) -> ConsistencyAnalyzer<u64> {
        let mut analyzer = ConsistencyAnalyzer::new();
        let names: Vec<String> = (0..states.len() + unreachable)
            .map(|i| format!("node-{}", i))
            .collect();
        analyzer.start_discovery(&names);
        for (i, state) in states.iter().enumerate() {
            analyzer.discovered(&names[i], &response(*state));
        }
        for name in &names[states.len()..] {
            analyzer.discover_fail(name, &Error::ConnectionFailed("refused".into()));
        }
        analyzer
    }

    #[test]
    fn test_accepting_cluster() {
        let uuid = Uuid::new_v4();
        let a = analyzer(&[None, Some((uuid, ChangeState::Committed))], 0);
        assert_eq!(a.global_state(), GlobalState::Accepting);
    }

    #[test]
    fn test_prepared_and_maybe_prepared() {
        let uuid = Uuid::new_v4();
        let all = [Some((uuid, ChangeState::Prepared)), Some((uuid, ChangeState::Prepared))];
        assert_eq!(analyzer(&all, 0).global_state(), GlobalState::Prepared);
        assert_eq!(analyzer(&all, 1).global_state(), GlobalState::MaybePrepared);
    }

    #[test]
    fn test_partial_states() {
        let uuid = Uuid::new_v4();
        let committed = [Some((uuid, ChangeState::Committed)), Some((uuid, ChangeState::Prepared))];
        assert_eq!(analyzer(&committed, 0).global_state(), GlobalState::PartiallyCommitted);
        assert_eq!(analyzer(&committed, 1).global_state(), GlobalState::MaybePartiallyCommitted);

        let rolled_back = [Some((uuid, ChangeState::RolledBack)), Some((uuid, ChangeState::Prepared))];
        assert_eq!(analyzer(&rolled_back, 0).global_state(), GlobalState::PartiallyRolledBack);

        let mixed = [
            Some((Uuid::new_v4(), ChangeState::Committed)),
            Some((uuid, ChangeState::Prepared)),
        ];
        assert_eq!(analyzer(&mixed, 0).global_state(), GlobalState::PartiallyPrepared);
    }

    #[test]
    fn test_failures_take_precedence() {
        let uuid = Uuid::new_v4();
        let mut a = analyzer(&[Some((uuid, ChangeState::Prepared))], 0);
        a.discover_other_client("node-0", "other-box", "bob");
        assert_eq!(a.global_state(), GlobalState::ConcurrentAccess);
        assert_eq!(a.other_client(), Some(("node-0", "other-box", "bob")));

        a.discover_fail("node-0", &Error::Halted("count violation".into()));
        assert_eq!(a.global_state(), GlobalState::DiscoveryFailure);
        assert_eq!(GlobalState::DiscoveryFailure.to_string(), "DISCOVERY_FAILURE");
    }
}
