//! Consistency verdicts and the decisions that lead to them

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::{ChangeState, DiscoverResponse};

/// Cluster-wide verdict reported at the end of every run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Consistency {
    Consistent,
    /// Some nodes missed a commit or rollback; `repair` can reconcile them
    MayNeedRecovery,
    /// Nothing was written, though the cluster state is not fully known
    UnknownButNoChange,
    UnrecoverablyInconsistent,
    UnrecoverablyPartitioned,
}

impl Consistency {
    pub fn is_consistent(&self) -> bool {
        *self == Consistency::Consistent
    }
}

impl std::fmt::Display for Consistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Consistency::Consistent => write!(f, "CONSISTENT"),
            Consistency::MayNeedRecovery => write!(f, "MAY_NEED_RECOVERY"),
            Consistency::UnknownButNoChange => write!(f, "UNKNOWN_BUT_NO_CHANGE"),
            Consistency::UnrecoverablyInconsistent => write!(f, "UNRECOVERABLY_INCONSISTENT"),
            Consistency::UnrecoverablyPartitioned => write!(f, "UNRECOVERABLY_PARTITIONED"),
        }
    }
}

/// Per-node outcome counts of one broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tally {
    pub succeeded: usize,
    /// Transport failures, timeouts and BAD rejections
    pub failed: usize,
    /// DEAD rejections
    pub other_client: usize,
    /// UNACCEPTABLE rejections (prepare only)
    pub unacceptable: usize,
}

impl Tally {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.other_client == 0 && self.unacceptable == 0
    }
}

/// Verdict after a commit or rollback broadcast
pub fn resolution_consistency(tally: &Tally, uncertain_nodes: usize) -> Consistency {
    if tally.all_succeeded() && uncertain_nodes == 0 {
        Consistency::Consistent
    } else {
        Consistency::MayNeedRecovery
    }
}

/// Verdict of a takeover-only run
pub fn takeover_consistency(tally: &Tally, unreachable: usize) -> Consistency {
    if tally.all_succeeded() && unreachable == 0 {
        Consistency::Consistent
    } else {
        Consistency::UnknownButNoChange
    }
}

/// What recovery should do with a change left prepared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    Nothing,
    Commit(Uuid),
    Rollback(Uuid),
    CannotDecide,
}

/// Decide the fate of the change still prepared on some nodes.
///
/// A change committed anywhere is committed everywhere, one rolled back
/// anywhere is rolled back everywhere. When every node answered and some of
/// them never saw the change, it cannot have been committed. Otherwise the
/// operator's `forced_state` decides.
pub fn decide_recovery<T>(
    discoveries: &[(String, DiscoverResponse<T>)],
    total_nodes: usize,
    forced_state: Option<ChangeState>,
) -> RecoveryDecision {
    let mut prepared_uuids: Vec<Uuid> = discoveries
        .iter()
        .filter(|(_, d)| d.latest_change_state() == Some(ChangeState::Prepared))
        .filter_map(|(_, d)| d.latest_change_uuid())
        .collect();
    prepared_uuids.sort();
    prepared_uuids.dedup();

    let uuid = match prepared_uuids.as_slice() {
        [] => return RecoveryDecision::Nothing,
        [uuid] => *uuid,
        _ => return RecoveryDecision::CannotDecide,
    };

    let committed_somewhere = discoveries.iter().any(|(_, d)| {
        d.latest_committed_change_uuid() == Some(uuid)
            || (d.latest_change_uuid() == Some(uuid)
                && d.latest_change_state() == Some(ChangeState::Committed))
    });
    let rolled_back_somewhere = discoveries.iter().any(|(_, d)| {
        d.latest_change_uuid() == Some(uuid)
            && d.latest_change_state() == Some(ChangeState::RolledBack)
    });

    match (committed_somewhere, rolled_back_somewhere) {
        (true, true) => return RecoveryDecision::CannotDecide,
        (true, false) => return RecoveryDecision::Commit(uuid),
        (false, true) => return RecoveryDecision::Rollback(uuid),
        (false, false) => {}
    }

    let missing_somewhere = discoveries
        .iter()
        .any(|(_, d)| d.latest_change_uuid() != Some(uuid));
    if missing_somewhere && discoveries.len() == total_nodes {
        return RecoveryDecision::Rollback(uuid);
    }

    match forced_state {
        Some(ChangeState::Committed) => RecoveryDecision::Commit(uuid),
        Some(ChangeState::RolledBack) => RecoveryDecision::Rollback(uuid),
        _ => RecoveryDecision::CannotDecide,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Change, ChangeDetails, NodeMode};
    use chrono::Utc;

    fn details(uuid: Uuid, state: ChangeState, version: u64) -> ChangeDetails<u64> {
        ChangeDetails {
            change_uuid: uuid,
            state,
            version,
            prev_change_uuid: None,
            change: Change::set("a", "1"),
            change_result: Some(version),
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
        let mode = match latest.as_ref().map(|l| l.state) {
            Some(ChangeState::Prepared) => NodeMode::Prepared,
            _ => NodeMode::Accepting,
        };
        (
            name.to_string(),
            DiscoverResponse {
                mode,
                mutative_message_count: 3,
                last_mutation_host: None,
                last_mutation_user: None,
                last_mutation_timestamp: None,
                current_version: committed.as_ref().map_or(0, |c| c.version),
                highest_version: latest.as_ref().map_or(0, |l| l.version),
                latest_change: latest,
                latest_committed_change: committed,
            },
        )
    }

    #[test]
    fn test_display_matches_serde() {
        for consistency in [
            Consistency::Consistent,
            Consistency::MayNeedRecovery,
            Consistency::UnknownButNoChange,
            Consistency::UnrecoverablyInconsistent,
            Consistency::UnrecoverablyPartitioned,
        ] {
            assert_eq!(
                serde_json::to_value(consistency).unwrap(),
                serde_json::Value::String(consistency.to_string())
            );
        }
    }

    #[test]
    fn test_resolution_consistency() {
        let clean = Tally {
            succeeded: 3,
            ..Tally::default()
        };
        assert_eq!(resolution_consistency(&clean, 0), Consistency::Consistent);
        assert_eq!(resolution_consistency(&clean, 1), Consistency::MayNeedRecovery);

        let partial = Tally {
            succeeded: 2,
            failed: 1,
            ..Tally::default()
        };
        assert_eq!(resolution_consistency(&partial, 0), Consistency::MayNeedRecovery);
        assert_eq!(takeover_consistency(&partial, 0), Consistency::UnknownButNoChange);
    }

    #[test]
    fn test_recovery_follows_committed_evidence() {
        let uuid = Uuid::new_v4();
        let discoveries = vec![
            node("a", Some(details(uuid, ChangeState::Committed, 1)), Some(details(uuid, ChangeState::Committed, 1))),
            node("b", Some(details(uuid, ChangeState::Prepared, 1)), None),
        ];
        assert_eq!(decide_recovery(&discoveries, 3, None), RecoveryDecision::Commit(uuid));
    }

    #[test]
    fn test_recovery_follows_rollback_evidence() {
        let uuid = Uuid::new_v4();
        let discoveries = vec![
            node("a", Some(details(uuid, ChangeState::RolledBack, 1)), None),
            node("b", Some(details(uuid, ChangeState::Prepared, 1)), None),
        ];
        assert_eq!(decide_recovery(&discoveries, 2, None), RecoveryDecision::Rollback(uuid));
    }

    #[test]
    fn test_recovery_without_evidence() {
        let uuid = Uuid::new_v4();
        let all_prepared = vec![
            node("a", Some(details(uuid, ChangeState::Prepared, 1)), None),
            node("b", Some(details(uuid, ChangeState::Prepared, 1)), None),
        ];
        assert_eq!(decide_recovery(&all_prepared, 3, None), RecoveryDecision::CannotDecide);
        assert_eq!(
            decide_recovery(&all_prepared, 3, Some(ChangeState::Committed)),
            RecoveryDecision::Commit(uuid)
        );

        // every node answered and one never saw the change: it was never committed
        let partially_prepared = vec![
            node("a", Some(details(uuid, ChangeState::Prepared, 1)), None),
            node("b", None, None),
        ];
        assert_eq!(
            decide_recovery(&partially_prepared, 2, None),
            RecoveryDecision::Rollback(uuid)
        );
    }

    #[test]
    fn test_nothing_to_recover() {
        let uuid = Uuid::new_v4();
        let discoveries = vec![node(
            "a",
            Some(details(uuid, ChangeState::Committed, 1)),
            Some(details(uuid, ChangeState::Committed, 1)),
        )];
        assert_eq!(decide_recovery(&discoveries, 1, None), RecoveryDecision::Nothing);
    }
}
