//! The batch aggregate.
//!
//! A [`Batch`] owns one invocation's records, the message items extracted
//! from them (including those later rejected), the unusable records, its
//! own batch-level tracked state and the task-definition catalog. The
//! orchestrator drives all mutation through the operations defined here:
//! extraction, sequencing, task revival, chain processing, discarding,
//! retry-cap enforcement, freezing and timeout marking.
//!
//! The three item collections are pairwise disjoint by construction:
//! message items live in one slice with `messages` / `rejected_messages`
//! index lists over it, and unusable records live in their own slice.

pub mod state;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, trace};

use crate::config::{ConsumerCallbacks, ConsumerConfig};
use crate::discard::{discard_timestamp, RejectedMessageEnvelope, UnusableRecordEnvelope};
use crate::error::ConsumerError;
use crate::identify;
use crate::lambda::Record;
use crate::sequence::{sequence_messages, SequencingInput};
use crate::task::{
    revive_task_map, BatchScope, MessageScope, ReviveMode, Task, TaskDef, TaskInput, TaskOutcome,
    TimeoutOpts,
};

use self::state::{BatchKey, BatchTrackedState, MessageItem, UnusableItem};

/// Name of the discard task created for each unusable record.
pub const DISCARD_UNUSABLE_RECORD_TASK: &str = "discardUnusableRecord";
/// Name of the discard task created for each rejected message.
pub const DISCARD_REJECTED_MESSAGE_TASK: &str = "discardRejectedMessage";
/// Name of the initiate-phase task.
pub const INITIATE_BATCH_TASK: &str = "initiateBatch";
/// Name of the process-phase task.
pub const PROCESS_BATCH_TASK: &str = "processBatch";
/// Name of the finalise-phase task.
pub const FINALISE_BATCH_TASK: &str = "finaliseBatch";

/// The catalog of task templates driving one batch.
#[derive(Debug, Clone)]
pub struct TaskDefs {
    /// Process-one templates, executed per message along key chains
    pub process_one: Vec<TaskDef>,
    /// Process-all templates, executed batch-wide as master tasks
    pub process_all: Vec<TaskDef>,
    /// Discard templates for unusable records
    pub discard_unusable: Vec<TaskDef>,
    /// Discard templates for rejected messages
    pub discard_rejected: Vec<TaskDef>,
    /// The initiate-phase template
    pub initiate: TaskDef,
    /// The process-phase template
    pub process: TaskDef,
    /// The finalise-phase template
    pub finalise: TaskDef,
}

impl TaskDefs {
    /// Materializes the catalog from the configured callbacks.
    ///
    /// The discard templates wrap the configured discard handlers; a
    /// missing discard handler fails construction.
    pub fn resolve(callbacks: &ConsumerCallbacks) -> Result<Self, ConsumerError> {
        let discard_unusable = callbacks.discard_unusable_record.clone().ok_or_else(|| {
            ConsumerError::fatal("A discard_unusable_record handler is required")
        })?;
        let discard_rejected = callbacks.discard_rejected_message.clone().ok_or_else(|| {
            ConsumerError::fatal("A discard_rejected_message handler is required")
        })?;

        let discard_unusable_def = TaskDef::new(
            DISCARD_UNUSABLE_RECORD_TASK,
            Arc::new(move |input| {
                let handler = discard_unusable.clone();
                Box::pin(async move {
                    match input {
                        TaskInput::UnusableRecord(envelope) => {
                            handler(envelope).await?;
                            Ok(Value::Null)
                        }
                        _ => Err(ConsumerError::validation(
                            "The unusable-record discard task requires an unusable-record input",
                        )),
                    }
                })
            }),
        )?;
        let discard_rejected_def = TaskDef::new(
            DISCARD_REJECTED_MESSAGE_TASK,
            Arc::new(move |input| {
                let handler = discard_rejected.clone();
                Box::pin(async move {
                    match input {
                        TaskInput::RejectedMessage(envelope) => {
                            handler(envelope).await?;
                            Ok(Value::Null)
                        }
                        _ => Err(ConsumerError::validation(
                            "The rejected-message discard task requires a rejected-message input",
                        )),
                    }
                })
            }),
        )?;

        Ok(Self {
            process_one: callbacks.process_one_task_defs.clone(),
            process_all: callbacks.process_all_task_defs.clone(),
            discard_unusable: vec![discard_unusable_def],
            discard_rejected: vec![discard_rejected_def],
            initiate: TaskDef::managed(INITIATE_BATCH_TASK),
            process: TaskDef::managed(PROCESS_BATCH_TASK),
            finalise: TaskDef::managed(FINALISE_BATCH_TASK),
        })
    }
}

/// Where an added message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMessageOutcome {
    /// Added to `messages`
    Added(usize),
    /// Added to `rejected_messages` with a rejection reason
    Rejected(usize),
    /// Routed to the unusable records instead
    Unusable(usize),
}

/// Progress counts over a batch's items.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    /// Messages still being processed
    pub messages: usize,
    /// Messages fully finalised
    pub finalised_messages: usize,
    /// Rejected messages
    pub rejected_messages: usize,
    /// Unusable records
    pub unusable_records: usize,
    /// Unusable records fully finalised
    pub finalised_unusable_records: usize,
}

/// Final summary of one invocation over a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    /// The batch key
    #[serde(rename = "key")]
    pub key: BatchKey,
    /// Number of records received
    #[serde(rename = "records")]
    pub records: usize,
    /// Number of messages still owned as messages
    #[serde(rename = "messages")]
    pub messages: usize,
    /// Number of rejected messages
    #[serde(rename = "rejectedMessages")]
    pub rejected_messages: usize,
    /// Number of unusable records
    #[serde(rename = "unusableRecords")]
    pub unusable_records: usize,
    /// Number of messages not yet fully finalised
    #[serde(rename = "incompleteMessages")]
    pub incomplete_messages: usize,
    /// Whether every item reached a terminal outcome
    #[serde(rename = "fullyFinalised")]
    pub fully_finalised: bool,
    /// Description of the final error, when one was surfaced
    #[serde(rename = "finalError", skip_serializing_if = "Option::is_none")]
    pub final_error: Option<String>,
}

/// The aggregate owning one invocation's records, messages and state.
#[derive(Debug)]
pub struct Batch {
    key: BatchKey,
    records: Vec<Record>,
    items: Vec<MessageItem>,
    messages: Vec<usize>,
    rejected_messages: Vec<usize>,
    unusable: Vec<UnusableItem>,
    state: BatchTrackedState,
    task_defs: TaskDefs,
    first_messages_to_process: Vec<usize>,
    previously_saved: Option<bool>,
}

impl Batch {
    /// Creates a batch over the given records.
    pub fn new(key: BatchKey, records: Vec<Record>, task_defs: TaskDefs) -> Self {
        Self {
            key,
            records,
            items: Vec::new(),
            messages: Vec::new(),
            rejected_messages: Vec::new(),
            unusable: Vec::new(),
            state: BatchTrackedState::default(),
            task_defs,
            first_messages_to_process: Vec::new(),
            previously_saved: None,
        }
    }

    /// The batch key.
    pub fn key(&self) -> &BatchKey {
        &self.key
    }

    /// The inbound records.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// All message items (messages and rejected messages).
    pub fn items(&self) -> &[MessageItem] {
        &self.items
    }

    /// One message item by index.
    pub fn item(&self, index: usize) -> Option<&MessageItem> {
        self.items.get(index)
    }

    /// Mutable access to one message item.
    pub fn item_mut(&mut self, index: usize) -> Option<&mut MessageItem> {
        self.items.get_mut(index)
    }

    /// Indices of the current messages.
    pub fn messages(&self) -> &[usize] {
        &self.messages
    }

    /// Indices of the rejected messages.
    pub fn rejected_messages(&self) -> &[usize] {
        &self.rejected_messages
    }

    /// The unusable records.
    pub fn unusable_records(&self) -> &[UnusableItem] {
        &self.unusable
    }

    /// Mutable access to the unusable records.
    pub fn unusable_records_mut(&mut self) -> &mut [UnusableItem] {
        &mut self.unusable
    }

    /// The batch's own tracked state.
    pub fn state(&self) -> &BatchTrackedState {
        &self.state
    }

    /// Mutable access to the batch's own tracked state.
    pub fn state_mut(&mut self) -> &mut BatchTrackedState {
        &mut self.state
    }

    /// The task-definition catalog.
    pub fn task_defs(&self) -> &TaskDefs {
        &self.task_defs
    }

    /// Heads of the sequencing chains, set by [`Batch::sequence`].
    pub fn first_messages_to_process(&self) -> &[usize] {
        &self.first_messages_to_process
    }

    /// The tri-state insert-vs-update flag.
    pub fn previously_saved(&self) -> Option<bool> {
        self.previously_saved
    }

    /// Updates the tri-state insert-vs-update flag.
    pub fn set_previously_saved(&mut self, previously_saved: Option<bool>) {
        self.previously_saved = previously_saved;
    }

    /// Adds an extracted message, resolving its coordinates, digests and
    /// identity.
    ///
    /// Identity-resolver failures land the message in `rejected_messages`;
    /// records whose coordinates cannot be resolved are routed to the
    /// unusable records. Digest-derivation failures are fatal.
    pub fn add_message(
        &mut self,
        message: Value,
        record_index: Option<usize>,
        user_record: Option<Value>,
        config: &ConsumerConfig,
        callbacks: &ConsumerCallbacks,
    ) -> Result<AddMessageOutcome, ConsumerError> {
        let record = match record_index.and_then(|i| self.records.get(i)) {
            Some(record) => record.clone(),
            None => {
                let index = self.add_unusable_record(
                    record_index,
                    user_record,
                    "Message arrived without a usable record",
                    callbacks,
                );
                return Ok(AddMessageOutcome::Unusable(index));
            }
        };
        let record = &record;

        let coords = match &callbacks.resolve_event_coordinates {
            Some(resolve) => resolve(record, user_record.as_ref()),
            None => identify::resolve_event_coordinates(record, user_record.as_ref()),
        };
        let coords = match coords {
            Ok(coords) => coords,
            Err(error) => {
                let index = self.add_unusable_record(
                    record_index,
                    user_record,
                    error.to_string(),
                    callbacks,
                );
                return Ok(AddMessageOutcome::Unusable(index));
            }
        };

        let digests = match &callbacks.generate_digests {
            Some(generate) => generate(Some(&message), record, user_record.as_ref()),
            None => identify::derive_digests(Some(&message), record, user_record.as_ref()),
        }
        .map_err(|e| ConsumerError::fatal(format!("Digest derivation failed: {e}")))?;

        let identity = match &callbacks.resolve_message_identity {
            Some(resolve) => resolve(&message, &coords, config),
            None => identify::resolve_message_identity(&message, &coords, config),
        };

        let index = self.items.len();
        match identity {
            Ok(identity) => {
                let description = identity.describe();
                self.items.push(MessageItem {
                    message,
                    record_index,
                    user_record,
                    identity,
                    coords,
                    digests,
                    description,
                    ones: BTreeMap::new(),
                    alls: BTreeMap::new(),
                    discards: BTreeMap::new(),
                    prev_message: None,
                    next_message: None,
                    reason_rejected: None,
                    prior: None,
                });
                self.messages.push(index);
                Ok(AddMessageOutcome::Added(index))
            }
            Err(error) => {
                let reason = error.to_string();
                debug!(%reason, "Message identity resolution failed; rejecting message");
                self.items.push(MessageItem {
                    message,
                    record_index,
                    user_record,
                    identity: Default::default(),
                    coords,
                    digests,
                    description: "rejected message".to_string(),
                    ones: BTreeMap::new(),
                    alls: BTreeMap::new(),
                    discards: BTreeMap::new(),
                    prev_message: None,
                    next_message: None,
                    reason_rejected: Some(reason),
                    prior: None,
                });
                self.rejected_messages.push(index);
                Ok(AddMessageOutcome::Rejected(index))
            }
        }
    }

    /// Adds an unusable record, attaching whatever coordinates and digests
    /// can still be derived.
    pub fn add_unusable_record(
        &mut self,
        record_index: Option<usize>,
        user_record: Option<Value>,
        reason: impl Into<String>,
        callbacks: &ConsumerCallbacks,
    ) -> usize {
        let record = record_index.and_then(|i| self.records.get(i));
        let coords = record.and_then(|r| {
            match &callbacks.resolve_event_coordinates {
                Some(resolve) => resolve(r, user_record.as_ref()),
                None => identify::resolve_event_coordinates(r, user_record.as_ref()),
            }
            .ok()
        });
        let digests = record
            .and_then(|r| {
                match &callbacks.generate_digests {
                    Some(generate) => generate(None, r, user_record.as_ref()),
                    None => identify::derive_digests(None, r, user_record.as_ref()),
                }
                .ok()
            })
            .unwrap_or_default();

        let reason = reason.into();
        info!(%reason, "Adding unusable record");
        let index = self.unusable.len();
        self.unusable.push(UnusableItem {
            record_index,
            user_record,
            coords,
            digests,
            reason_unusable: reason,
            discards: BTreeMap::new(),
            prior: None,
        });
        index
    }

    /// Sequences the current messages into per-key chains (or one global
    /// chain) and records the chain heads.
    pub fn sequence(&mut self, config: &ConsumerConfig) -> Result<(), ConsumerError> {
        let inputs: Vec<SequencingInput> = self
            .messages
            .iter()
            .filter_map(|&index| {
                self.items.get(index).map(|item| SequencingInput {
                    index,
                    key: item.identity.key.clone(),
                    seq_nos: item.identity.seq_nos.clone(),
                })
            })
            .collect();

        let outcome =
            sequence_messages(inputs, config.sequencing_per_key, config.sequencing_required)?;
        for sequenced in &outcome.messages {
            if let Some(item) = self.items.get_mut(sequenced.index) {
                item.prev_message = sequenced.prev;
                item.next_message = sequenced.next;
            }
        }
        self.first_messages_to_process = outcome.first_messages_to_process;
        Ok(())
    }

    /// Revives every item's task trees (and the batch's own) from their
    /// prior snapshots, then wires the master/slave links between the
    /// batch-level process-all tasks and the per-message mirrors.
    pub fn revive_tasks(&mut self) {
        let defs = self.task_defs.clone();

        for item in &mut self.items {
            let prior = item.prior.clone();
            let empty = BTreeMap::new();
            let (prior_ones, prior_alls, prior_discards) = match &prior {
                Some(p) => (&p.ones, &p.alls, &p.discards),
                None => (&empty, &empty, &empty),
            };
            item.ones = revive_task_map(&defs.process_one, prior_ones, ReviveMode::CreateMissing);
            item.alls = revive_task_map(&defs.process_all, prior_alls, ReviveMode::CreateMissing);
            // Discard-rejected tasks are created lazily at discard time.
            item.discards =
                revive_task_map(&defs.discard_rejected, prior_discards, ReviveMode::OnlyExisting);
        }

        for item in &mut self.unusable {
            let prior = item.prior.clone();
            let empty = BTreeMap::new();
            let prior_discards = prior.as_ref().map(|p| &p.discards).unwrap_or(&empty);
            item.discards =
                revive_task_map(&defs.discard_unusable, prior_discards, ReviveMode::CreateMissing);
        }

        let prior = self.state.prior.clone();
        let empty = BTreeMap::new();
        let (prior_alls, prior_initiating, prior_processing, prior_finalising) = match &prior {
            Some(p) => (&p.alls, &p.initiating, &p.processing, &p.finalising),
            None => (&empty, &empty, &empty, &empty),
        };
        self.state.alls =
            revive_task_map(&defs.process_all, prior_alls, ReviveMode::CreateMissing);
        self.state.initiating = revive_task_map(
            std::slice::from_ref(&defs.initiate),
            prior_initiating,
            ReviveMode::CreateMissing,
        );
        self.state.processing = revive_task_map(
            std::slice::from_ref(&defs.process),
            prior_processing,
            ReviveMode::CreateMissing,
        );
        self.state.finalising = revive_task_map(
            std::slice::from_ref(&defs.finalise),
            prior_finalising,
            ReviveMode::CreateMissing,
        );

        // Masters mirror onto the per-message tasks of the same name.
        for (name, master) in &self.state.alls {
            let slaves: Vec<Task> = self
                .messages
                .iter()
                .filter_map(|&index| self.items.get(index))
                .filter_map(|item| item.alls.get(name).cloned())
                .collect();
            master.set_slaves(slaves);
        }
    }

    fn one_scope(&self, index: usize) -> Option<TaskInput> {
        let item = self.items.get(index)?;
        Some(TaskInput::Message(MessageScope {
            message: item.message.clone(),
            record: item
                .record_index
                .and_then(|i| self.records.get(i))
                .map(|r| r.as_value().clone()),
            user_record: item.user_record.clone(),
            batch_key: self.key.clone(),
            description: item.description.clone(),
        }))
    }

    /// Builds the dead-record envelope of one unusable record.
    pub fn unusable_envelope(&self, index: usize) -> Option<UnusableRecordEnvelope> {
        let item = self.unusable.get(index)?;
        Some(UnusableRecordEnvelope {
            stream_consumer_id: self.key.stream_consumer_id.clone(),
            shard_or_event_id: self.key.shard_or_event_id.clone(),
            event_id: item.coords.as_ref().map(|c| c.event_id.clone()),
            event_seq_no: item.coords.as_ref().map(|c| c.event_seq_no.clone()),
            md5s: item.digests.clone(),
            reason_unusable: item.reason_unusable.clone(),
            record: item
                .record_index
                .and_then(|i| self.records.get(i))
                .map(|r| r.as_value().clone()),
            user_record: item.user_record.clone(),
            discarded_at: discard_timestamp(),
        })
    }

    /// Builds the dead-message envelope of one rejected message.
    pub fn rejected_envelope(&self, index: usize) -> Option<RejectedMessageEnvelope> {
        let item = self.items.get(index)?;
        let reason = item
            .reason_rejected
            .clone()
            .or_else(|| Self::rejection_reason(item))
            .unwrap_or_else(|| "rejected".to_string());
        Some(RejectedMessageEnvelope {
            stream_consumer_id: self.key.stream_consumer_id.clone(),
            shard_or_event_id: self.key.shard_or_event_id.clone(),
            id: item.identity.id.clone(),
            key: item.identity.key.clone(),
            seq_no: item.identity.seq_no.clone(),
            message: item.message.clone(),
            record: item
                .record_index
                .and_then(|i| self.records.get(i))
                .map(|r| r.as_value().clone()),
            user_record: item.user_record.clone(),
            reason_rejected: reason,
            discarded_at: discard_timestamp(),
        })
    }

    fn rejection_reason(item: &MessageItem) -> Option<String> {
        item.ones
            .values()
            .chain(item.alls.values())
            .find(|task| task.state().is_rejection())
            .and_then(|task| {
                task.reason().or_else(|| task.last_error().map(|e| e.message))
            })
    }

    /// Processes one key chain: executes each message's incomplete
    /// process-one tasks and advances to the next message only once every
    /// process-one task of the current message is fully finalised.
    pub async fn process_chain(&self, head: usize) -> Vec<TaskOutcome> {
        let mut outcomes = Vec::new();
        let mut current = Some(head);
        while let Some(index) = current {
            let Some(item) = self.items.get(index) else { break };
            let incomplete: Vec<Task> =
                item.ones.values().filter(|t| !t.is_fully_finalised()).cloned().collect();
            if !incomplete.is_empty() {
                if let Some(input) = self.one_scope(index) {
                    let executions = incomplete.iter().map(|task| task.execute(input.clone()));
                    outcomes.extend(join_all(executions).await);
                }
            }
            if !item.ones.values().all(Task::is_fully_finalised) {
                trace!(item = %item.description, "Chain blocked on incomplete process-one tasks");
                break;
            }
            current = item.next_message;
        }
        outcomes
    }

    /// Executes every incomplete batch-wide process-all master against the
    /// current view of incomplete messages. Master transitions mirror onto
    /// the per-message tasks.
    pub async fn process_all_tasks(&self) -> Vec<TaskOutcome> {
        let incomplete_messages: Vec<Value> = self
            .messages
            .iter()
            .filter_map(|&index| self.items.get(index))
            .filter(|item| !item.is_fully_finalised())
            .map(|item| item.message.clone())
            .collect();
        let masters: Vec<Task> =
            self.state.alls.values().filter(|t| !t.is_fully_finalised()).cloned().collect();
        if masters.is_empty() {
            return Vec::new();
        }
        let input = TaskInput::Batch(BatchScope {
            messages: incomplete_messages,
            batch_key: self.key.clone(),
        });
        join_all(masters.iter().map(|master| master.execute(input.clone()))).await
    }

    /// Executes the not-yet-finalised discard tasks of every unusable
    /// record.
    pub async fn discard_unusable_records(&self) -> Vec<TaskOutcome> {
        let mut outcomes = Vec::new();
        for (index, item) in self.unusable.iter().enumerate() {
            let Some(envelope) = self.unusable_envelope(index) else { continue };
            let pending: Vec<Task> =
                item.discards.values().filter(|t| !t.is_fully_finalised()).cloned().collect();
            for task in pending {
                outcomes.push(task.execute(TaskInput::UnusableRecord(envelope.clone())).await);
            }
        }
        outcomes
    }

    /// Moves messages that are fully finalised but contain a
    /// rejection-family outcome from `messages` to `rejected_messages`.
    ///
    /// Returns how many messages moved.
    pub fn move_finalised_rejected_messages(&mut self) -> usize {
        let candidates: Vec<usize> = self
            .messages
            .iter()
            .copied()
            .filter(|&index| {
                self.items
                    .get(index)
                    .map(|item| item.is_fully_finalised() && item.contains_rejection())
                    .unwrap_or(false)
            })
            .collect();
        for &index in &candidates {
            self.move_message_to_rejected(index, None);
        }
        candidates.len()
    }

    /// Moves one message to `rejected_messages`, setting its rejection
    /// reason if it has none yet.
    pub fn move_message_to_rejected(&mut self, index: usize, reason: Option<String>) {
        if !self.messages.contains(&index) {
            return;
        }
        self.messages.retain(|&i| i != index);
        if !self.rejected_messages.contains(&index) {
            self.rejected_messages.push(index);
        }
        let fallback = self.items.get(index).and_then(Self::rejection_reason);
        if let Some(item) = self.items.get_mut(index) {
            if item.reason_rejected.is_none() {
                item.reason_rejected = reason
                    .or(fallback)
                    .or_else(|| Some("rejected".to_string()));
            }
            debug!(item = %item.description, "Moved message to rejected messages");
        }
    }

    /// Moves newly finalised-but-rejected messages, then executes the
    /// not-yet-finalised discard tasks of every rejected message.
    pub async fn discard_rejected_messages(&mut self) -> Vec<TaskOutcome> {
        self.move_finalised_rejected_messages();

        // Materialize missing discard tasks before executing.
        let discard_defs = self.task_defs.discard_rejected.clone();
        let rejected = self.rejected_messages.clone();
        for &index in &rejected {
            if let Some(item) = self.items.get_mut(index) {
                for def in &discard_defs {
                    item.discards
                        .entry(def.name().to_string())
                        .or_insert_with(|| Task::from_def(def));
                }
            }
        }

        let mut outcomes = Vec::new();
        for &index in &rejected {
            let Some(envelope) = self.rejected_envelope(index) else { continue };
            let Some(item) = self.items.get(index) else { continue };
            let pending: Vec<Task> =
                item.discards.values().filter(|t| !t.is_fully_finalised()).cloned().collect();
            for task in pending {
                outcomes.push(task.execute(TaskInput::RejectedMessage(envelope.clone())).await);
            }
        }
        outcomes
    }

    fn processing_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = Vec::new();
        for &index in &self.messages {
            if let Some(item) = self.items.get(index) {
                tasks.extend(item.ones.values().cloned());
                tasks.extend(item.alls.values().cloned());
            }
        }
        tasks.extend(self.state.alls.values().cloned());
        tasks
    }

    fn finalising_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = Vec::new();
        for item in &self.items {
            tasks.extend(item.discards.values().cloned());
        }
        for item in &self.unusable {
            tasks.extend(item.discards.values().cloned());
        }
        tasks
    }

    /// Applies the retry cap to every processing task.
    pub fn discard_processing_tasks_if_over_attempted(&self, max_attempts: u32) -> usize {
        self.processing_tasks()
            .iter()
            .map(|task| task.discard_if_over_attempted(max_attempts, true))
            .sum()
    }

    /// Applies the retry cap to every finalising (discard) task.
    pub fn discard_finalising_tasks_if_over_attempted(&self, max_attempts: u32) -> usize {
        self.finalising_tasks()
            .iter()
            .map(|task| task.discard_if_over_attempted(max_attempts, true))
            .sum()
    }

    /// Abandons dead processing sub-tasks that alone keep their roots from
    /// finalising.
    pub fn abandon_dead_processing_tasks(&self) -> usize {
        self.processing_tasks()
            .iter()
            .map(|task| task.abandon_dead("Task definition no longer exists"))
            .sum()
    }

    /// Abandons dead finalising sub-tasks.
    pub fn abandon_dead_finalising_tasks(&self) -> usize {
        self.finalising_tasks()
            .iter()
            .map(|task| task.abandon_dead("Task definition no longer exists"))
            .sum()
    }

    /// Freezes every processing task (and the process-phase task) so no
    /// further mutations occur after the phase race is decided.
    pub fn freeze_processing_tasks(&self) {
        for task in self.processing_tasks() {
            task.freeze();
        }
        for task in self.state.processing.values() {
            task.freeze();
        }
    }

    /// Freezes every finalising (discard) task. The finalise-phase task
    /// itself stays unfrozen so it can record its own completion after the
    /// checkpoint save.
    pub fn freeze_finalising_tasks(&self) {
        for task in self.finalising_tasks() {
            task.freeze();
        }
    }

    /// Marks every not-yet-finalised processing task as timed out with
    /// reversible-attempt semantics.
    pub fn timeout_processing_tasks(&self, error: &ConsumerError) {
        let opts = TimeoutOpts { reverse_attempt: true, ..TimeoutOpts::default() };
        for task in self.processing_tasks().into_iter().chain(self.state.processing.values().cloned())
        {
            if !task.is_fully_finalised() {
                if let Err(transition_error) = task.timeout(error, opts) {
                    debug!(task = %task.name(), error = %transition_error, "Timeout rejected");
                }
            }
        }
    }

    /// Marks every not-yet-finalised finalising task as timed out with
    /// reversible-attempt semantics.
    pub fn timeout_finalising_tasks(&self, error: &ConsumerError) {
        let opts = TimeoutOpts { reverse_attempt: true, ..TimeoutOpts::default() };
        for task in self.finalising_tasks().into_iter().chain(self.state.finalising.values().cloned())
        {
            if !task.is_fully_finalised() {
                if let Err(transition_error) = task.timeout(error, opts) {
                    debug!(task = %task.name(), error = %transition_error, "Timeout rejected");
                }
            }
        }
    }

    /// Returns true if every per-message task, every batch-wide master and
    /// every unusable-record discard is terminal.
    pub fn is_fully_finalised(&self) -> bool {
        self.items.iter().all(MessageItem::is_fully_finalised)
            && self.state.alls.values().all(Task::is_fully_finalised)
            && self.unusable.iter().all(UnusableItem::is_fully_finalised)
    }

    /// Counts the batch's progress.
    pub fn assess_progress(&self) -> BatchProgress {
        let finalised_messages = self
            .messages
            .iter()
            .filter_map(|&i| self.items.get(i))
            .filter(|item| item.is_fully_finalised())
            .count();
        let finalised_unusable_records =
            self.unusable.iter().filter(|item| item.is_fully_finalised()).count();
        BatchProgress {
            messages: self.messages.len(),
            finalised_messages,
            rejected_messages: self.rejected_messages.len(),
            unusable_records: self.unusable.len(),
            finalised_unusable_records,
        }
    }

    /// A one-line description of the batch for log lines.
    pub fn describe(&self) -> String {
        format!(
            "batch {} with {} message(s), {} rejected message(s), {} unusable record(s) of {} record(s)",
            self.key,
            self.messages.len(),
            self.rejected_messages.len(),
            self.unusable.len(),
            self.records.len()
        )
    }

    /// Summarizes the batch's final results for the invocation's output.
    pub fn summarize_final_results(&self, final_error: Option<&ConsumerError>) -> BatchSummary {
        let incomplete_messages = self
            .messages
            .iter()
            .filter_map(|&i| self.items.get(i))
            .filter(|item| !item.is_fully_finalised())
            .count();
        BatchSummary {
            key: self.key.clone(),
            records: self.records.len(),
            messages: self.messages.len(),
            rejected_messages: self.rejected_messages.len(),
            unusable_records: self.unusable.len(),
            incomplete_messages,
            fully_finalised: self.is_fully_finalised(),
            final_error: final_error.map(|e| e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConsumerCallbacks, ConsumerConfig};
    use crate::lambda::{FixedInvocationContext, Record};
    use crate::task::TaskStateKind;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(seq_no: u64, key: &str, n: i64) -> Record {
        Record::new(json!({
            "eventID": format!("shardId-000000000000:{seq_no}"),
            "eventSourceARN": "arn:aws:kinesis:us-west-2:111111111111:stream/TestStream",
            "kinesis": {
                "sequenceNumber": seq_no.to_string(),
                "partitionKey": key,
            },
            "body": {"k": key, "n": n}
        }))
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig {
            consumer_id: Some("c1".to_string()),
            key_property_names: vec!["k".to_string()],
            seq_no_property_names: vec!["n".to_string()],
            ..ConsumerConfig::default()
        }
    }

    fn callbacks() -> ConsumerCallbacks {
        ConsumerCallbacks {
            extract_message_from_record: Some(Arc::new(|record, _| {
                record
                    .as_value()
                    .get("body")
                    .cloned()
                    .ok_or_else(|| ConsumerError::unusable("Record has no body"))
            })),
            discard_unusable_record: Some(Arc::new(|_| Box::pin(async { Ok(()) }))),
            discard_rejected_message: Some(Arc::new(|_| Box::pin(async { Ok(()) }))),
            process_one_task_defs: vec![TaskDef::new(
                "processOne",
                Arc::new(|_| Box::pin(async { Ok(Value::Null) })),
            )
            .expect("valid def")],
            ..ConsumerCallbacks::default()
        }
    }

    fn batch_with(records: Vec<Record>, callbacks: &ConsumerCallbacks) -> Batch {
        let context =
            FixedInvocationContext::new("fn", "live", std::time::Duration::from_secs(60));
        let key = BatchKey::resolve(&records, &config(), &context).expect("key");
        Batch::new(key, records, TaskDefs::resolve(callbacks).expect("task defs"))
    }

    fn populate(batch: &mut Batch, callbacks: &ConsumerCallbacks) {
        let config = config();
        for index in 0..batch.records().len() {
            let record = batch.records()[index].clone();
            match callbacks.extract(&record) {
                Ok(extracted) => {
                    for one in extracted {
                        batch
                            .add_message(one.message, Some(index), one.user_record, &config, callbacks)
                            .expect("add message");
                    }
                }
                Err(error) => {
                    batch.add_unusable_record(Some(index), None, error.to_string(), callbacks);
                }
            }
        }
    }

    #[test]
    fn test_task_defs_require_discard_handlers() {
        let mut callbacks = callbacks();
        callbacks.discard_unusable_record = None;
        assert!(TaskDefs::resolve(&callbacks).unwrap_err().is_fatal());
    }

    #[test]
    fn test_lists_are_pairwise_disjoint() {
        let callbacks = callbacks();
        let records = vec![
            record(1, "K1", 1),
            Record::new(json!({
                "eventID": "shardId-000000000000:2",
                "eventSourceARN": "arn:aws:kinesis:us-west-2:111111111111:stream/TestStream",
                "kinesis": {"sequenceNumber": "2"}
            })),
        ];
        let mut batch = batch_with(records, &callbacks);
        populate(&mut batch, &callbacks);

        assert_eq!(batch.messages().len(), 1);
        assert_eq!(batch.unusable_records().len(), 1);
        assert!(batch.rejected_messages().is_empty());
        for index in batch.messages() {
            assert!(!batch.rejected_messages().contains(index));
        }
    }

    #[test]
    fn test_identity_failure_rejects_message() {
        let callbacks = callbacks();
        // Missing the configured key property "k".
        let bad = Record::new(json!({
            "eventID": "shardId-000000000000:5",
            "eventSourceARN": "arn:aws:kinesis:us-west-2:111111111111:stream/TestStream",
            "kinesis": {"sequenceNumber": "5"},
            "body": {"n": 5}
        }));
        let mut batch = batch_with(vec![bad], &callbacks);
        populate(&mut batch, &callbacks);

        assert!(batch.messages().is_empty());
        assert_eq!(batch.rejected_messages().len(), 1);
        let item = batch.item(batch.rejected_messages()[0]).unwrap();
        assert!(item.reason_rejected.as_deref().unwrap().contains("key property"));
    }

    #[test]
    fn test_sequence_reversed_same_key() {
        let callbacks = callbacks();
        let mut batch = batch_with(
            vec![record(1, "K1", 3), record(2, "K1", 1), record(3, "K1", 2)],
            &callbacks,
        );
        populate(&mut batch, &callbacks);
        batch.sequence(&config()).unwrap();

        assert_eq!(batch.first_messages_to_process(), &[1]);
        let head = batch.item(1).unwrap();
        assert_eq!(head.next_message, Some(2));
        assert_eq!(batch.item(2).unwrap().next_message, Some(0));
        assert_eq!(batch.item(0).unwrap().next_message, None);
    }

    #[test]
    fn test_revive_creates_fresh_trees_and_wires_masters() {
        let mut callbacks = callbacks();
        callbacks.process_all_task_defs = vec![TaskDef::new(
            "processAll",
            Arc::new(|_| Box::pin(async { Ok(Value::Null) })),
        )
        .unwrap()];
        let mut batch = batch_with(vec![record(1, "A", 1), record(2, "B", 1)], &callbacks);
        populate(&mut batch, &callbacks);
        batch.sequence(&config()).unwrap();
        batch.revive_tasks();

        let master = batch.state().alls.get("processAll").unwrap().clone();
        assert_eq!(master.slaves().len(), 2);

        master.start().unwrap();
        for &index in batch.messages() {
            let item = batch.item(index).unwrap();
            assert_eq!(item.alls["processAll"].state(), TaskStateKind::Started);
        }
    }

    #[tokio::test]
    async fn test_process_chain_respects_ordering() {
        let order: Arc<std::sync::Mutex<Vec<i64>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = order.clone();
        let mut callbacks = callbacks();
        callbacks.process_one_task_defs = vec![TaskDef::new(
            "processOne",
            Arc::new(move |input| {
                let seen = seen.clone();
                Box::pin(async move {
                    if let TaskInput::Message(scope) = input {
                        if let Some(n) = scope.message.get("n").and_then(|v| v.as_i64()) {
                            seen.lock().unwrap().push(n);
                        }
                    }
                    Ok(Value::Null)
                })
            }),
        )
        .unwrap()];

        let mut batch = batch_with(
            vec![record(1, "K1", 3), record(2, "K1", 1), record(3, "K1", 2)],
            &callbacks,
        );
        populate(&mut batch, &callbacks);
        batch.sequence(&config()).unwrap();
        batch.revive_tasks();

        let heads = batch.first_messages_to_process().to_vec();
        for head in heads {
            batch.process_chain(head).await;
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        assert!(batch.is_fully_finalised());
    }

    #[tokio::test]
    async fn test_process_chain_stops_at_failure() {
        let mut callbacks = callbacks();
        callbacks.process_one_task_defs = vec![TaskDef::new(
            "processOne",
            Arc::new(move |input| {
                Box::pin(async move {
                    if let TaskInput::Message(scope) = input {
                        if scope.message.get("n").and_then(|v| v.as_i64()) == Some(1) {
                            return Err(ConsumerError::task_failure("processOne", "boom"));
                        }
                    }
                    Ok(Value::Null)
                })
            }),
        )
        .unwrap()];

        let mut batch = batch_with(vec![record(1, "K1", 1), record(2, "K1", 2)], &callbacks);
        populate(&mut batch, &callbacks);
        batch.sequence(&config()).unwrap();
        batch.revive_tasks();

        let outcomes = batch.process_chain(batch.first_messages_to_process()[0]).await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_failure());

        // The second message never started.
        let second = batch.item(1).unwrap();
        assert_eq!(second.ones["processOne"].state(), TaskStateKind::Unstarted);
        assert!(!batch.is_fully_finalised());
    }

    #[tokio::test]
    async fn test_discard_unusable_records_executes_tasks() {
        let published = Arc::new(AtomicUsize::new(0));
        let count = published.clone();
        let mut callbacks = callbacks();
        callbacks.discard_unusable_record = Some(Arc::new(move |_| {
            let count = count.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }));

        let bad = Record::new(json!({
            "eventID": "shardId-000000000000:9",
            "eventSourceARN": "arn:aws:kinesis:us-west-2:111111111111:stream/TestStream",
            "kinesis": {"sequenceNumber": "9"}
        }));
        let mut batch = batch_with(vec![bad], &callbacks);
        populate(&mut batch, &callbacks);
        batch.revive_tasks();

        let outcomes = batch.discard_unusable_records().await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(published.load(Ordering::SeqCst), 1);
        assert!(batch.is_fully_finalised());

        // A second pass has nothing left to do.
        let outcomes = batch.discard_unusable_records().await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_discard_moves_and_publishes() {
        let published = Arc::new(AtomicUsize::new(0));
        let count = published.clone();
        let mut callbacks = callbacks();
        callbacks.discard_rejected_message = Some(Arc::new(move |envelope| {
            let count = count.clone();
            Box::pin(async move {
                assert!(!envelope.reason_rejected.is_empty());
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }));
        callbacks.process_one_task_defs = vec![TaskDef::new(
            "processOne",
            Arc::new(|_| Box::pin(async { Err(ConsumerError::rejection("not ours")) })),
        )
        .unwrap()];

        let mut batch = batch_with(vec![record(1, "K1", 1)], &callbacks);
        populate(&mut batch, &callbacks);
        batch.sequence(&config()).unwrap();
        batch.revive_tasks();
        batch.process_chain(batch.first_messages_to_process()[0]).await;

        let outcomes = batch.discard_rejected_messages().await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(published.load(Ordering::SeqCst), 1);
        assert!(batch.messages().is_empty());
        assert_eq!(batch.rejected_messages().len(), 1);
        assert!(batch.is_fully_finalised());
    }

    #[tokio::test]
    async fn test_over_attempt_cap_discards_and_moves_to_rejected() {
        let mut callbacks = callbacks();
        callbacks.process_one_task_defs = vec![TaskDef::new(
            "processOne",
            Arc::new(|_| Box::pin(async { Err(ConsumerError::task_failure("processOne", "boom")) })),
        )
        .unwrap()];

        let mut batch = batch_with(vec![record(1, "K1", 1)], &callbacks);
        populate(&mut batch, &callbacks);
        batch.sequence(&config()).unwrap();
        batch.revive_tasks();

        // Two failing attempts reach the cap of 2.
        batch.process_chain(batch.first_messages_to_process()[0]).await;
        batch.process_chain(batch.first_messages_to_process()[0]).await;
        assert_eq!(batch.discard_processing_tasks_if_over_attempted(2), 1);

        let moved = batch.move_finalised_rejected_messages();
        assert_eq!(moved, 1);
        assert_eq!(batch.rejected_messages().len(), 1);
        let item = batch.item(0).unwrap();
        assert_eq!(item.ones["processOne"].state(), TaskStateKind::Discarded);
    }

    #[test]
    fn test_timeout_processing_reverses_attempts() {
        let callbacks = callbacks();
        let mut batch = batch_with(vec![record(1, "K1", 1)], &callbacks);
        populate(&mut batch, &callbacks);
        batch.sequence(&config()).unwrap();
        batch.revive_tasks();

        let task = batch.item(0).unwrap().ones["processOne"].clone();
        task.start().unwrap();
        assert_eq!(task.attempts(), 1);

        batch.timeout_processing_tasks(&ConsumerError::timeout_reversible("deadline"));
        assert_eq!(task.state(), TaskStateKind::TimedOut);
        assert_eq!(task.attempts(), 0);
    }

    #[test]
    fn test_freeze_processing_blocks_transitions() {
        let callbacks = callbacks();
        let mut batch = batch_with(vec![record(1, "K1", 1)], &callbacks);
        populate(&mut batch, &callbacks);
        batch.sequence(&config()).unwrap();
        batch.revive_tasks();
        batch.freeze_processing_tasks();

        let task = batch.item(0).unwrap().ones["processOne"].clone();
        assert!(task.start().unwrap_err().is_finalised());
    }

    #[test]
    fn test_progress_and_summary() {
        let callbacks = callbacks();
        let mut batch = batch_with(vec![record(1, "K1", 1), record(2, "K2", 1)], &callbacks);
        populate(&mut batch, &callbacks);
        batch.sequence(&config()).unwrap();
        batch.revive_tasks();

        let progress = batch.assess_progress();
        assert_eq!(progress.messages, 2);
        assert_eq!(progress.finalised_messages, 0);

        let summary = batch.summarize_final_results(Some(&ConsumerError::incomplete("still going")));
        assert_eq!(summary.records, 2);
        assert_eq!(summary.incomplete_messages, 2);
        assert!(!summary.fully_finalised);
        assert!(summary.final_error.as_deref().unwrap().contains("still going"));
        assert!(batch.describe().contains("2 message(s)"));
    }
}
