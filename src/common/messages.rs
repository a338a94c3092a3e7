//! Messages exchanged between the orchestrator and the nodes
//!
//! Every mutative message carries the sender's view of the node's mutative
//! message count. A node whose count differs rejects the message as `DEAD`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::{Change, ChangeState};

/// Node mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeMode {
    /// Accepts new prepares
    Accepting,
    /// One change in flight
    Prepared,
}

impl std::fmt::Display for NodeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeMode::Accepting => write!(f, "ACCEPTING"),
            NodeMode::Prepared => write!(f, "PREPARED"),
        }
    }
}

impl std::str::FromStr for NodeMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "ACCEPTING" => Ok(NodeMode::Accepting),
            "PREPARED" => Ok(NodeMode::Prepared),
            other => Err(crate::Error::Corrupted(format!("unknown node mode: {}", other))),
        }
    }
}

/// Header shared by prepare, commit, rollback and takeover
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub expected_mutative_message_count: u64,
    pub mutation_host: String,
    pub mutation_user: String,
    pub mutation_timestamp: DateTime<Utc>,
}

impl Mutation {
    pub fn new(
        expected_mutative_message_count: u64,
        mutation_host: impl Into<String>,
        mutation_user: impl Into<String>,
        mutation_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            expected_mutative_message_count,
            mutation_host: mutation_host.into(),
            mutation_user: mutation_user.into(),
            mutation_timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareMessage {
    #[serde(flatten)]
    pub mutation: Mutation,
    pub change_uuid: Uuid,
    pub version_number: u64,
    pub change: Change,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMessage {
    #[serde(flatten)]
    pub mutation: Mutation,
    pub change_uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackMessage {
    #[serde(flatten)]
    pub mutation: Mutation,
    pub change_uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeoverMessage {
    #[serde(flatten)]
    pub mutation: Mutation,
}

/// Why a node refused a mutative message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionReason {
    /// A protocol precondition was violated
    Bad,
    /// The sender's mutative message count is stale
    Dead,
    /// The change applicator refused the change itself
    Unacceptable,
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::Bad => write!(f, "BAD"),
            RejectionReason::Dead => write!(f, "DEAD"),
            RejectionReason::Unacceptable => write!(f, "UNACCEPTABLE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptRejectResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<RejectionReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_mutation_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_mutation_user: Option<String>,
}

impl AcceptRejectResponse {
    pub fn accept() -> Self {
        Self {
            accepted: true,
            rejection_reason: None,
            rejection_message: None,
            last_mutation_host: None,
            last_mutation_user: None,
        }
    }

    pub fn reject(
        reason: RejectionReason,
        message: impl Into<String>,
        last_mutation_host: Option<String>,
        last_mutation_user: Option<String>,
    ) -> Self {
        Self {
            accepted: false,
            rejection_reason: Some(reason),
            rejection_message: Some(message.into()),
            last_mutation_host,
            last_mutation_user,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    pub fn rejection_message(&self) -> &str {
        self.rejection_message.as_deref().unwrap_or("")
    }
}

/// Full detail of one change record, as seen by clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeDetails<T> {
    pub change_uuid: Uuid,
    pub state: ChangeState,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_change_uuid: Option<Uuid>,
    pub change: Change,
    pub change_result: Option<T>,
    pub creation_host: String,
    pub creation_user: String,
    pub creation_timestamp: DateTime<Utc>,
    pub change_result_hash: Option<String>,
}

/// A node's state, as returned by `discover`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverResponse<T> {
    pub mode: NodeMode,
    pub mutative_message_count: u64,
    pub last_mutation_host: Option<String>,
    pub last_mutation_user: Option<String>,
    pub last_mutation_timestamp: Option<DateTime<Utc>>,
    pub current_version: u64,
    pub highest_version: u64,
    pub latest_change: Option<ChangeDetails<T>>,
    pub latest_committed_change: Option<ChangeDetails<T>>,
}

impl<T> DiscoverResponse<T> {
    /// State of the latest change, if any
    pub fn latest_change_state(&self) -> Option<ChangeState> {
        self.latest_change.as_ref().map(|c| c.state)
    }

    pub fn latest_change_uuid(&self) -> Option<Uuid> {
        self.latest_change.as_ref().map(|c| c.change_uuid)
    }

    pub fn latest_committed_change_uuid(&self) -> Option<Uuid> {
        self.latest_committed_change.as_ref().map(|c| c.change_uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_message_wire_shape() {
        let msg = PrepareMessage {
            mutation: Mutation::new(3, "ops-box", "alice", Utc::now()),
            change_uuid: Uuid::new_v4(),
            version_number: 4,
            change: Change::set("a", "1"),
        };
        let json = serde_json::to_value(&msg).unwrap();
        // the mutation header is flattened into the message
        assert_eq!(json["expected_mutative_message_count"], 3);
        assert_eq!(json["mutation_user"], "alice");
        assert_eq!(json["change"]["type"], "setting");

        let back: PrepareMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_reject_response() {
        let response = AcceptRejectResponse::reject(
            RejectionReason::Dead,
            "stale",
            Some("other-box".into()),
            Some("bob".into()),
        );
        assert!(!response.is_accepted());
        assert_eq!(response.rejection_message(), "stale");

        let json = serde_json::to_string(&AcceptRejectResponse::accept()).unwrap();
        assert_eq!(json, r#"{"accepted":true}"#);
    }
}
