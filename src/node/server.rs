//! Per-node protocol state machine
//!
//! `ACCEPTING` accepts a new prepare. `PREPARED` holds exactly one change in
//! flight until a commit or a rollback names it.
//!
//! Every mutative call advances the mutative message count by exactly one.
//! Any other delta halts the node: later calls return [`Error::Halted`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use uuid::Uuid;

use crate::common::{
    AcceptRejectResponse, ChangeDetails, ChangeState, CommitMessage, DiscoverResponse, Error,
    Mutation, NodeMode, PrepareMessage, RejectionReason, Result, RollbackMessage,
    TakeoverMessage,
};
use crate::node::applicator::ChangeApplicator;
use crate::node::config_store::ConfigSnapshot;
use crate::node::state::{ChangeRecord, NewChange, ServerState, StateChange};

pub struct NomadServer<T: ConfigSnapshot> {
    state: ServerState<T>,
    applicator: Arc<dyn ChangeApplicator<T>>,
    halted: Option<String>,
}

impl<T: ConfigSnapshot> NomadServer<T> {
    pub fn new(state: ServerState<T>, applicator: Arc<dyn ChangeApplicator<T>>) -> Self {
        Self {
            state,
            applicator,
            halted: None,
        }
    }

    fn ensure_running(&self) -> Result<()> {
        match &self.halted {
            Some(reason) => Err(Error::Halted(reason.clone())),
            None => Ok(()),
        }
    }

    /// Apply a state change and check the message count moved by exactly one
    fn apply_mutation(&mut self, change: StateChange<T>) -> Result<()> {
        let before = self.state.mutative_message_count()?;
        self.state.apply_state_change(change)?;
        let after = self.state.mutative_message_count()?;

        if after != before + 1 {
            let err = Error::MutativeCountViolation {
                expected: before + 1,
                actual: after,
            };
            tracing::error!("Halting node: {}", err);
            self.halted = Some(err.to_string());
            return Err(err);
        }
        Ok(())
    }

    fn reject(&self, reason: RejectionReason, message: String) -> Result<AcceptRejectResponse> {
        tracing::debug!("Rejecting message ({}): {}", reason, message);
        Ok(AcceptRejectResponse::reject(
            reason,
            message,
            self.state.last_mutation_host()?,
            self.state.last_mutation_user()?,
        ))
    }

    fn check_count(&self, mutation: &Mutation) -> Result<Option<String>> {
        let count = self.state.mutative_message_count()?;
        if mutation.expected_mutative_message_count != count {
            return Ok(Some(format!(
                "expected mutative message count {} but node is at {}",
                mutation.expected_mutative_message_count, count
            )));
        }
        Ok(None)
    }

    fn record(&self, change_uuid: Uuid) -> Result<ChangeRecord<T>> {
        self.state
            .get_change_record(change_uuid)?
            .ok_or_else(|| Error::Corrupted(format!("missing change record {}", change_uuid)))
    }

    /// Walk the chain backward from the latest change.
    /// A revisited uuid means the chain is corrupted.
    fn walk_chain(&self) -> Result<Vec<(Uuid, ChangeRecord<T>)>> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut next = self.state.latest_change_uuid()?;

        while let Some(uuid) = next {
            if !visited.insert(uuid) {
                return Err(Error::Corrupted(format!(
                    "cycle in change chain at {}",
                    uuid
                )));
            }
            let record = self.record(uuid)?;
            next = record.prev_change_uuid;
            chain.push((uuid, record));
        }
        Ok(chain)
    }

    fn latest_committed(&self) -> Result<Option<(Uuid, ChangeRecord<T>)>> {
        let mut visited = HashSet::new();
        let mut next = self.state.latest_change_uuid()?;

        while let Some(uuid) = next {
            if !visited.insert(uuid) {
                return Err(Error::Corrupted(format!(
                    "cycle in change chain at {}",
                    uuid
                )));
            }
            let record = self.record(uuid)?;
            if record.state == ChangeState::Committed {
                return Ok(Some((uuid, record)));
            }
            next = record.prev_change_uuid;
        }
        Ok(None)
    }

    pub fn discover(&self) -> Result<DiscoverResponse<T>> {
        self.ensure_running()?;

        let latest_change = match self.state.latest_change_uuid()? {
            Some(uuid) => Some(self.record(uuid)?.into_details(uuid)),
            None => None,
        };
        let latest_committed_change = self
            .latest_committed()?
            .map(|(uuid, record)| record.into_details(uuid));

        Ok(DiscoverResponse {
            mode: self.state.mode()?,
            mutative_message_count: self.state.mutative_message_count()?,
            last_mutation_host: self.state.last_mutation_host()?,
            last_mutation_user: self.state.last_mutation_user()?,
            last_mutation_timestamp: self.state.last_mutation_timestamp()?,
            current_version: self.state.current_version()?,
            highest_version: self.state.highest_version()?,
            latest_change,
            latest_committed_change,
        })
    }

    pub fn prepare(&mut self, message: PrepareMessage) -> Result<AcceptRejectResponse> {
        self.ensure_running()?;

        if let Some(stale) = self.check_count(&message.mutation)? {
            return self.reject(RejectionReason::Dead, stale);
        }

        let mode = self.state.mode()?;
        if mode != NodeMode::Accepting {
            return self.reject(
                RejectionReason::Bad,
                format!("cannot prepare a change while in {} mode", mode),
            );
        }

        let highest_version = self.state.highest_version()?;
        if message.version_number <= highest_version {
            return self.reject(
                RejectionReason::Bad,
                format!(
                    "version {} is not above the highest version {}",
                    message.version_number, highest_version
                ),
            );
        }

        if self.state.has_change(message.change_uuid)? {
            return self.reject(
                RejectionReason::Bad,
                format!("change {} already exists", message.change_uuid),
            );
        }

        let existing = self.state.current_committed_config()?;
        let outcome = self.applicator.try_apply(existing.as_ref(), &message.change);
        let allowed = outcome.is_allowed();
        let rejection_reason = outcome.rejection_reason().to_string();

        // the record is written whether or not the applicator allows the change
        let mutation = &message.mutation;
        let mut change = self.state.new_state_change()?;
        change
            .mode(NodeMode::Prepared)
            .latest_change_uuid(message.change_uuid)
            .highest_version(message.version_number)
            .last_mutation(
                &mutation.mutation_host,
                &mutation.mutation_user,
                mutation.mutation_timestamp,
            );
        change.create_change(NewChange {
            change_uuid: message.change_uuid,
            state: ChangeState::Prepared,
            version: message.version_number,
            prev_change_uuid: self.state.latest_change_uuid()?,
            change: message.change,
            change_result: outcome.into_new_config(),
            creation_host: mutation.mutation_host.clone(),
            creation_user: mutation.mutation_user.clone(),
            creation_timestamp: mutation.mutation_timestamp,
        })?;
        self.apply_mutation(change)?;

        if allowed {
            tracing::debug!(
                "Prepared change {} at version {}",
                message.change_uuid,
                message.version_number
            );
            Ok(AcceptRejectResponse::accept())
        } else {
            self.reject(RejectionReason::Unacceptable, rejection_reason)
        }
    }

    pub fn commit(&mut self, message: CommitMessage) -> Result<AcceptRejectResponse> {
        self.ensure_running()?;

        if let Some(rejection) =
            self.check_resolution(&message.mutation, message.change_uuid, "commit")?
        {
            return Ok(rejection);
        }

        let record = self.record(message.change_uuid)?;
        self.applicator.apply(&record.change)?;

        let mutation = &message.mutation;
        let mut change = self.state.new_state_change()?;
        change
            .mode(NodeMode::Accepting)
            .current_version(record.version)
            .latest_change_uuid(message.change_uuid)
            .last_mutation(
                &mutation.mutation_host,
                &mutation.mutation_user,
                mutation.mutation_timestamp,
            );
        self.state
            .update_change_state(&mut change, message.change_uuid, ChangeState::Committed)?;
        self.apply_mutation(change)?;

        tracing::debug!(
            "Committed change {} at version {}",
            message.change_uuid,
            record.version
        );
        Ok(AcceptRejectResponse::accept())
    }

    pub fn rollback(&mut self, message: RollbackMessage) -> Result<AcceptRejectResponse> {
        self.ensure_running()?;

        if let Some(rejection) =
            self.check_resolution(&message.mutation, message.change_uuid, "roll back")?
        {
            return Ok(rejection);
        }

        let mutation = &message.mutation;
        let mut change = self.state.new_state_change()?;
        change.mode(NodeMode::Accepting).last_mutation(
            &mutation.mutation_host,
            &mutation.mutation_user,
            mutation.mutation_timestamp,
        );
        self.state
            .update_change_state(&mut change, message.change_uuid, ChangeState::RolledBack)?;
        self.apply_mutation(change)?;

        tracing::debug!("Rolled back change {}", message.change_uuid);
        Ok(AcceptRejectResponse::accept())
    }

    /// Checks shared by commit and rollback
    fn check_resolution(
        &self,
        mutation: &Mutation,
        change_uuid: Uuid,
        action: &str,
    ) -> Result<Option<AcceptRejectResponse>> {
        if let Some(stale) = self.check_count(mutation)? {
            return self.reject(RejectionReason::Dead, stale).map(Some);
        }

        let mode = self.state.mode()?;
        if mode != NodeMode::Prepared {
            return self
                .reject(
                    RejectionReason::Bad,
                    format!("cannot {} a change while in {} mode", action, mode),
                )
                .map(Some);
        }

        // only the change in flight can be resolved
        let latest = self.state.latest_change_uuid()?;
        if latest != Some(change_uuid) {
            return self
                .reject(
                    RejectionReason::Bad,
                    format!("cannot {} change {}: it is not in flight", action, change_uuid),
                )
                .map(Some);
        }
        let state = self.record(change_uuid)?.state;
        if state != ChangeState::Prepared {
            return self
                .reject(
                    RejectionReason::Bad,
                    format!("cannot {} change {}: it is already {}", action, change_uuid, state),
                )
                .map(Some);
        }
        Ok(None)
    }

    pub fn takeover(&mut self, message: TakeoverMessage) -> Result<AcceptRejectResponse> {
        self.ensure_running()?;

        if let Some(stale) = self.check_count(&message.mutation)? {
            return self.reject(RejectionReason::Dead, stale);
        }

        let mutation = &message.mutation;
        let mut change = self.state.new_state_change()?;
        change.last_mutation(
            &mutation.mutation_host,
            &mutation.mutation_user,
            mutation.mutation_timestamp,
        );
        self.apply_mutation(change)?;

        tracing::debug!(
            "Takeover by {}@{}",
            mutation.mutation_user,
            mutation.mutation_host
        );
        Ok(AcceptRejectResponse::accept())
    }

    /// True while a change is in flight. Mode and chain are both checked.
    pub fn has_incomplete_change(&self) -> Result<bool> {
        self.ensure_running()?;

        if self.state.mode()? == NodeMode::Prepared {
            return Ok(true);
        }
        match self.state.latest_change_uuid()? {
            Some(uuid) => Ok(self.record(uuid)?.state == ChangeState::Prepared),
            None => Ok(false),
        }
    }

    /// Every change record, oldest first
    pub fn change_history(&self) -> Result<Vec<ChangeDetails<T>>> {
        self.ensure_running()?;

        let mut history: Vec<_> = self
            .walk_chain()?
            .into_iter()
            .map(|(uuid, record)| record.into_details(uuid))
            .collect();
        history.reverse();
        Ok(history)
    }

    /// Replace the local history with `history` (oldest first) from a healthy node.
    ///
    /// Refused when a change committed here is not committed in `history`.
    /// A change committed in `history` but not here is recorded PREPARED,
    /// applied, then marked COMMITTED. A failed apply leaves it in flight.
    pub fn force_sync(&mut self, history: Vec<ChangeDetails<T>>) -> Result<()> {
        self.ensure_running()?;

        let source: HashMap<Uuid, ChangeState> = history
            .iter()
            .map(|details| (details.change_uuid, details.state))
            .collect();

        let mut locally_committed = HashSet::new();
        for (uuid, record) in self.walk_chain()? {
            if record.state != ChangeState::Committed {
                continue;
            }
            match source.get(&uuid) {
                Some(ChangeState::Committed) => {
                    locally_committed.insert(uuid);
                }
                Some(state) => {
                    return Err(Error::Inconsistent(format!(
                        "change {} is committed here but {} in the source history",
                        uuid, state
                    )))
                }
                None => {
                    return Err(Error::Inconsistent(format!(
                        "change {} is committed here but absent from the source history",
                        uuid
                    )))
                }
            }
        }

        let mut last_version = 0;
        for details in &history {
            if details.version <= last_version {
                return Err(Error::Inconsistent(format!(
                    "source history is not ordered by version at change {}",
                    details.change_uuid
                )));
            }
            last_version = details.version;

            let actual = crate::common::config_hash(details.change_result.as_ref())?;
            if actual != details.change_result_hash {
                return Err(Error::BadHash {
                    change_uuid: details.change_uuid,
                    expected: details.change_result_hash.clone(),
                    actual,
                });
            }
        }

        let count = self.state.mutative_message_count()?;
        let host = self.state.last_mutation_host()?;
        let user = self.state.last_mutation_user()?;
        let timestamp = self.state.last_mutation_timestamp()?;

        self.state.reset()?;

        // keep the message count monotonic so stale clients stay DEAD
        let mut restore = self.state.new_state_change()?;
        restore.mutative_message_count(count + 1);
        if let (Some(host), Some(user), Some(timestamp)) = (&host, &user, timestamp) {
            restore.last_mutation(host, user, timestamp);
        }
        self.state.apply_state_change(restore)?;

        let replayed = history.len();
        for details in history {
            let change_uuid = details.change_uuid;
            let version = details.version;
            let needs_apply = details.state == ChangeState::Committed
                && !locally_committed.contains(&change_uuid);

            // a change not yet applied here is recorded PREPARED first, so a
            // failed apply leaves it in flight instead of falsely committed
            let recorded_state = if needs_apply {
                ChangeState::Prepared
            } else {
                details.state
            };

            let mut change = self.state.new_state_change()?;
            change
                .latest_change_uuid(change_uuid)
                .highest_version(version)
                .mode(if recorded_state == ChangeState::Prepared {
                    NodeMode::Prepared
                } else {
                    NodeMode::Accepting
                });
            if recorded_state == ChangeState::Committed {
                change.current_version(version);
            }
            let operation = details.change.clone();
            change.create_change(NewChange {
                change_uuid,
                state: recorded_state,
                version,
                prev_change_uuid: details.prev_change_uuid,
                change: details.change,
                change_result: details.change_result,
                creation_host: details.creation_host,
                creation_user: details.creation_user,
                creation_timestamp: details.creation_timestamp,
            })?;
            self.apply_mutation(change)?;

            if needs_apply {
                self.applicator.apply(&operation)?;

                let mut commit = self.state.new_state_change()?;
                commit.mode(NodeMode::Accepting).current_version(version);
                self.state
                    .update_change_state(&mut commit, change_uuid, ChangeState::Committed)?;
                self.apply_mutation(commit)?;
            }
        }

        tracing::info!(
            "Synced {} change(s), current version {}",
            replayed,
            self.state.current_version()?
        );
        Ok(())
    }

    /// Drop the whole change history
    pub fn reset(&mut self) -> Result<()> {
        self.ensure_running()?;
        self.state.reset()?;
        tracing::warn!("Change state reset");
        Ok(())
    }
}
