//! Typed view of a node's change state
//!
//! Node-wide fields and change records are stored in the [`ChangeLog`] under
//! their logical names. Each change record lives under its uuid string.
//! Config snapshots live in a separate [`ConfigStorage`]; each record keeps
//! the snapshot hash so a drift between the two stores is caught on read.
//!
//! All writes go through a [`StateChange`] built with
//! [`ServerState::new_state_change`] and committed atomically by
//! [`ServerState::apply_state_change`].

use crate::common::{
    config_hash, Change, ChangeDetails, ChangeState, Error, NodeMode, Result,
};
use crate::node::config_store::{ConfigSnapshot, ConfigStorage};
use crate::node::log::{ChangeLog, LogBatch};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const MODE_KEY: &str = "mode";
pub const MUTATIVE_MESSAGE_COUNT_KEY: &str = "mutativeMessageCount";
pub const LAST_MUTATION_HOST_KEY: &str = "lastMutationHost";
pub const LAST_MUTATION_USER_KEY: &str = "lastMutationUser";
pub const LAST_MUTATION_TIMESTAMP_KEY: &str = "lastMutationTimestamp";
pub const LATEST_CHANGE_UUID_KEY: &str = "latestChangeUuid";
pub const CURRENT_VERSION_KEY: &str = "currentVersion";
pub const HIGHEST_VERSION_KEY: &str = "highestVersion";

/// One entry of the change chain
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord<T> {
    pub state: ChangeState,
    pub version: u64,
    pub prev_change_uuid: Option<Uuid>,
    pub change: Change,
    pub change_result: Option<T>,
    pub creation_host: String,
    pub creation_user: String,
    pub creation_timestamp: DateTime<Utc>,
    pub change_result_hash: Option<String>,
}

impl<T> ChangeRecord<T> {
    pub fn into_details(self, change_uuid: Uuid) -> ChangeDetails<T> {
        ChangeDetails {
            change_uuid,
            state: self.state,
            version: self.version,
            prev_change_uuid: self.prev_change_uuid,
            change: self.change,
            change_result: self.change_result,
            creation_host: self.creation_host,
            creation_user: self.creation_user,
            creation_timestamp: self.creation_timestamp,
            change_result_hash: self.change_result_hash,
        }
    }
}

/// Persisted form of a change record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredChange {
    state: ChangeState,
    version: u64,
    operation: Change,
    #[serde(default)]
    prev_change_uuid: Option<Uuid>,
    #[serde(default)]
    result_hash: Option<String>,
    creation_host: String,
    creation_user: String,
    creation_timestamp: DateTime<Utc>,
}

/// Fields of a record created by a prepare (or replayed by a sync)
#[derive(Debug, Clone)]
pub struct NewChange<T> {
    pub change_uuid: Uuid,
    pub state: ChangeState,
    pub version: u64,
    pub prev_change_uuid: Option<Uuid>,
    pub change: Change,
    pub change_result: Option<T>,
    pub creation_host: String,
    pub creation_user: String,
    pub creation_timestamp: DateTime<Utc>,
}

/// Atomic multi-field update
pub struct StateChange<T> {
    batch: LogBatch,
    configs: Vec<(u64, Option<T>)>,
    new_changes: Vec<(Uuid, StoredChange)>,
}

impl<T: ConfigSnapshot> StateChange<T> {
    fn empty() -> Self {
        Self {
            batch: LogBatch::new(),
            configs: Vec::new(),
            new_changes: Vec::new(),
        }
    }

    pub fn mode(&mut self, mode: NodeMode) -> &mut Self {
        self.batch.put(MODE_KEY, Value::String(mode.to_string()));
        self
    }

    pub fn mutative_message_count(&mut self, count: u64) -> &mut Self {
        self.batch.put(MUTATIVE_MESSAGE_COUNT_KEY, Value::from(count));
        self
    }

    pub fn last_mutation(
        &mut self,
        host: &str,
        user: &str,
        timestamp: DateTime<Utc>,
    ) -> &mut Self {
        self.batch
            .put(LAST_MUTATION_HOST_KEY, Value::String(host.to_string()))
            .put(LAST_MUTATION_USER_KEY, Value::String(user.to_string()))
            .put(
                LAST_MUTATION_TIMESTAMP_KEY,
                Value::String(timestamp.to_rfc3339()),
            );
        self
    }

    pub fn latest_change_uuid(&mut self, change_uuid: Uuid) -> &mut Self {
        self.batch
            .put(LATEST_CHANGE_UUID_KEY, Value::String(change_uuid.to_string()));
        self
    }

    pub fn current_version(&mut self, version: u64) -> &mut Self {
        self.batch.put(CURRENT_VERSION_KEY, Value::from(version));
        self
    }

    pub fn highest_version(&mut self, version: u64) -> &mut Self {
        self.batch.put(HIGHEST_VERSION_KEY, Value::from(version));
        self
    }

    /// Create a record and save its config snapshot under its version
    pub fn create_change(&mut self, new_change: NewChange<T>) -> Result<&mut Self> {
        let result_hash = config_hash(new_change.change_result.as_ref())?;
        let stored = StoredChange {
            state: new_change.state,
            version: new_change.version,
            operation: new_change.change,
            prev_change_uuid: new_change.prev_change_uuid,
            result_hash,
            creation_host: new_change.creation_host,
            creation_user: new_change.creation_user,
            creation_timestamp: new_change.creation_timestamp,
        };
        self.batch.put(
            new_change.change_uuid.to_string(),
            serde_json::to_value(&stored)?,
        );
        self.configs
            .push((new_change.version, new_change.change_result));
        self.new_changes.push((new_change.change_uuid, stored));
        Ok(self)
    }

    fn stage_state(&mut self, change_uuid: Uuid, stored: StoredChange) -> Result<()> {
        self.batch
            .put(change_uuid.to_string(), serde_json::to_value(&stored)?);
        Ok(())
    }
}

/// Typed change state of one node
pub struct ServerState<T: ConfigSnapshot> {
    log: Box<dyn ChangeLog>,
    configs: Box<dyn ConfigStorage<T>>,
}

impl<T: ConfigSnapshot> ServerState<T> {
    /// Open the state, initializing it on first use
    pub fn open(log: Box<dyn ChangeLog>, configs: Box<dyn ConfigStorage<T>>) -> Result<Self> {
        let mut state = Self { log, configs };
        state.initialize_if_needed()?;
        Ok(state)
    }

    fn initialize_if_needed(&mut self) -> Result<()> {
        if self.is_initialized()? {
            return Ok(());
        }

        let mut change = self.new_state_change()?;
        change
            .mode(NodeMode::Accepting)
            .current_version(0)
            .highest_version(0);
        self.apply_state_change(change)?;
        tracing::debug!("Initialized empty change state");
        Ok(())
    }

    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.log.get(MODE_KEY)?.is_some())
    }

    fn get_typed<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        match self.log.get(key)? {
            Some(value) => Ok(Some(serde_json::from_value(value).map_err(|e| {
                Error::Corrupted(format!("undecodable value for {}: {}", key, e))
            })?)),
            None => Ok(None),
        }
    }

    pub fn mode(&self) -> Result<NodeMode> {
        self.get_typed::<NodeMode>(MODE_KEY)?
            .ok_or_else(|| Error::Corrupted("missing node mode".into()))
    }

    pub fn mutative_message_count(&self) -> Result<u64> {
        Ok(self.get_typed(MUTATIVE_MESSAGE_COUNT_KEY)?.unwrap_or(0))
    }

    pub fn last_mutation_host(&self) -> Result<Option<String>> {
        self.get_typed(LAST_MUTATION_HOST_KEY)
    }

    pub fn last_mutation_user(&self) -> Result<Option<String>> {
        self.get_typed(LAST_MUTATION_USER_KEY)
    }

    pub fn last_mutation_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        self.get_typed(LAST_MUTATION_TIMESTAMP_KEY)
    }

    pub fn latest_change_uuid(&self) -> Result<Option<Uuid>> {
        self.get_typed(LATEST_CHANGE_UUID_KEY)
    }

    pub fn current_version(&self) -> Result<u64> {
        Ok(self.get_typed(CURRENT_VERSION_KEY)?.unwrap_or(0))
    }

    pub fn highest_version(&self) -> Result<u64> {
        Ok(self.get_typed(HIGHEST_VERSION_KEY)?.unwrap_or(0))
    }

    pub fn has_change(&self, change_uuid: Uuid) -> Result<bool> {
        Ok(self.log.get(&change_uuid.to_string())?.is_some())
    }

    fn stored_change(&self, change_uuid: Uuid) -> Result<Option<StoredChange>> {
        self.get_typed(&change_uuid.to_string())
    }

    /// Read a record back, verifying its config snapshot against the stored hash
    pub fn get_change_record(&self, change_uuid: Uuid) -> Result<Option<ChangeRecord<T>>> {
        let stored = match self.stored_change(change_uuid)? {
            Some(stored) => stored,
            None => return Ok(None),
        };

        let change_result = self.configs.get_config(stored.version)?;
        let actual = config_hash(change_result.as_ref())?;
        if actual != stored.result_hash {
            return Err(Error::BadHash {
                change_uuid,
                expected: stored.result_hash,
                actual,
            });
        }

        Ok(Some(ChangeRecord {
            state: stored.state,
            version: stored.version,
            prev_change_uuid: stored.prev_change_uuid,
            change: stored.operation,
            change_result,
            creation_host: stored.creation_host,
            creation_user: stored.creation_user,
            creation_timestamp: stored.creation_timestamp,
            change_result_hash: stored.result_hash,
        }))
    }

    /// Config produced by the latest committed change
    pub fn current_committed_config(&self) -> Result<Option<T>> {
        match self.current_version()? {
            0 => Ok(None),
            version => self.configs.get_config(version),
        }
    }

    /// Start an atomic update, preset to advance the mutative message count by one
    pub fn new_state_change(&self) -> Result<StateChange<T>> {
        let mut change = StateChange::empty();
        change.mutative_message_count(self.mutative_message_count()? + 1);
        Ok(change)
    }

    /// Stage a state transition of an existing record
    pub fn update_change_state(
        &self,
        change: &mut StateChange<T>,
        change_uuid: Uuid,
        state: ChangeState,
    ) -> Result<()> {
        let staged = change
            .new_changes
            .iter()
            .find(|(uuid, _)| *uuid == change_uuid)
            .map(|(_, stored)| stored.clone());
        let mut stored = match staged {
            Some(stored) => stored,
            None => self.stored_change(change_uuid)?.ok_or_else(|| {
                Error::Internal(format!("no change record for {}", change_uuid))
            })?,
        };
        stored.state = state;
        change.stage_state(change_uuid, stored)
    }

    /// Durably commit every edit of `change`.
    ///
    /// Snapshots are written before the log batch, so a record never
    /// references a snapshot that is missing.
    pub fn apply_state_change(&mut self, change: StateChange<T>) -> Result<()> {
        for (version, config) in &change.configs {
            self.configs.save_config(*version, config.as_ref())?;
        }
        self.log.apply(change.batch)
    }

    /// Drop the whole state, then initialize it again
    pub fn reset(&mut self) -> Result<()> {
        self.log.reset()?;
        self.configs.reset()?;
        self.initialize_if_needed()
    }
}
