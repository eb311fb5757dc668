//! Configuration for the stream consumer core.
//!
//! [`ConsumerConfig`] is the single explicit configuration record: stream
//! type, sequencing toggles, consumer identity, deadline fraction, retry
//! cap, identity property names and the stage-qualified external names.
//! [`ConsumerCallbacks`] carries the user-supplied hooks: message
//! extraction, identity/digest overrides, checkpoint load/save overrides,
//! discard handlers, the three lifecycle hooks and the process-one /
//! process-all task definitions.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::batch::state::{BatchKey, BatchStateItem};
use crate::batch::Batch;
use crate::discard::{RejectedMessageEnvelope, UnusableRecordEnvelope};
use crate::error::ConsumerError;
use crate::identify::{Digests, EventCoordinates, MessageIdentity};
use crate::lambda::{InvocationContext, Record};
use crate::task::TaskDef;

/// The kind of partitioned event stream being consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamType {
    /// A Kinesis stream (shard-keyed batches, base64 data payloads)
    #[serde(rename = "kinesis")]
    Kinesis,
    /// A DynamoDB stream (event-id-keyed batches)
    #[serde(rename = "dynamodb")]
    DynamoDb,
}

impl StreamType {
    /// Returns true for Kinesis streams.
    pub fn is_kinesis(&self) -> bool {
        matches!(self, Self::Kinesis)
    }

    /// Returns true for DynamoDB streams.
    pub fn is_dynamodb(&self) -> bool {
        matches!(self, Self::DynamoDb)
    }
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kinesis => write!(f, "kinesis"),
            Self::DynamoDb => write!(f, "dynamodb"),
        }
    }
}

/// The explicit configuration record of a stream consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Selects shard-id vs event-id batch keying and record-shape
    /// expectations
    pub stream_type: StreamType,
    /// Fail hard on ambiguous sequencing instead of warning
    pub sequencing_required: bool,
    /// Per-key chains vs a single global chain
    pub sequencing_per_key: bool,
    /// Force event-id keying even for Kinesis
    pub batch_keyed_on_event_id: bool,
    /// Explicit consumer id; derived from the function identity when absent
    pub consumer_id: Option<String>,
    /// Suffix appended to the derived consumer id
    pub consumer_id_suffix: Option<String>,
    /// Deployment stage used to qualify external names; blank disables
    /// qualification
    pub stage: String,
    /// Fraction of the remaining time at which phase deadlines fire
    pub timeout_at_percentage_of_remaining_time: f64,
    /// Retry cap before a task is discarded
    pub max_number_of_attempts: u32,
    /// Property names that uniquely identify a message
    pub id_property_names: Vec<String>,
    /// Property names that group messages into key chains
    pub key_property_names: Vec<String>,
    /// Property names that order messages within a key chain
    pub seq_no_property_names: Vec<String>,
    /// Unqualified name of the checkpoint table
    pub batch_state_table_name: String,
    /// Unqualified name of the dead-record stream
    pub dead_record_queue_name: String,
    /// Unqualified name of the dead-message stream
    pub dead_message_queue_name: String,
    /// Bypass the process-wide event-source-mapping id cache
    pub avoid_esm_cache: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            stream_type: StreamType::Kinesis,
            sequencing_required: false,
            sequencing_per_key: true,
            batch_keyed_on_event_id: false,
            consumer_id: None,
            consumer_id_suffix: None,
            stage: String::new(),
            timeout_at_percentage_of_remaining_time: 0.9,
            max_number_of_attempts: 10,
            id_property_names: Vec::new(),
            key_property_names: Vec::new(),
            seq_no_property_names: Vec::new(),
            batch_state_table_name: "StreamConsumerBatchState".to_string(),
            dead_record_queue_name: "DeadRecordQueue".to_string(),
            dead_message_queue_name: "DeadMessageQueue".to_string(),
            avoid_esm_cache: false,
        }
    }
}

impl ConsumerConfig {
    /// Validates the configuration. Violations are fatal.
    pub fn validate(&self) -> Result<(), ConsumerError> {
        let pct = self.timeout_at_percentage_of_remaining_time;
        if !(0.0..=1.0).contains(&pct) || !pct.is_finite() {
            return Err(ConsumerError::fatal(format!(
                "timeout_at_percentage_of_remaining_time must be within [0, 1], got {pct}"
            )));
        }
        if self.max_number_of_attempts < 1 {
            return Err(ConsumerError::fatal("max_number_of_attempts must be at least 1"));
        }
        if self.batch_state_table_name.trim().is_empty() {
            return Err(ConsumerError::fatal("batch_state_table_name must not be blank"));
        }
        if self.dead_record_queue_name.trim().is_empty() {
            return Err(ConsumerError::fatal("dead_record_queue_name must not be blank"));
        }
        if self.dead_message_queue_name.trim().is_empty() {
            return Err(ConsumerError::fatal("dead_message_queue_name must not be blank"));
        }
        if let Some(id) = &self.consumer_id {
            if id.trim().is_empty() {
                return Err(ConsumerError::fatal("consumer_id must not be blank when given"));
            }
        }
        Ok(())
    }

    /// Resolves the consumer id: the explicit `consumer_id` wins; otherwise
    /// it is derived from the function name and alias, with the optional
    /// suffix appended. The resolved id must be non-blank.
    pub fn resolve_consumer_id(
        &self,
        context: &dyn InvocationContext,
    ) -> Result<String, ConsumerError> {
        let resolved = match &self.consumer_id {
            Some(id) => id.clone(),
            None => {
                let mut derived =
                    format!("{}:{}", context.function_name(), context.function_version());
                if let Some(suffix) = &self.consumer_id_suffix {
                    if !suffix.trim().is_empty() {
                        derived.push(':');
                        derived.push_str(suffix);
                    }
                }
                derived
            }
        };
        if resolved.trim().is_empty() || resolved == ":" {
            return Err(ConsumerError::fatal(
                "Consumer id resolved to blank; set consumer_id or run with a named function",
            ));
        }
        Ok(resolved)
    }

    /// Stage-qualifies an external name (`{name}_{STAGE}`); a blank stage
    /// leaves the name untouched.
    pub fn stage_qualified(&self, name: &str) -> String {
        if self.stage.trim().is_empty() {
            name.to_string()
        } else {
            format!("{}_{}", name, self.stage.to_uppercase())
        }
    }

    /// The stage-qualified checkpoint table name.
    pub fn batch_state_table(&self) -> String {
        self.stage_qualified(&self.batch_state_table_name)
    }

    /// The stage-qualified dead-record stream name.
    pub fn dead_record_queue(&self) -> String {
        self.stage_qualified(&self.dead_record_queue_name)
    }

    /// The stage-qualified dead-message stream name.
    pub fn dead_message_queue(&self) -> String {
        self.stage_qualified(&self.dead_message_queue_name)
    }
}

/// A message extracted from a record, optionally paired with the user
/// record it came from (for aggregate encodings).
#[derive(Debug, Clone)]
pub struct ExtractedMessage {
    /// The extracted message
    pub message: Value,
    /// The user record the message came from, if any
    pub user_record: Option<Value>,
}

/// Extracts all messages from one record (one-to-many).
pub type ExtractMessagesFromRecordFn =
    Arc<dyn Fn(&Record) -> Result<Vec<ExtractedMessage>, ConsumerError> + Send + Sync>;

/// Extracts a single message from one record or user record (one-to-one).
pub type ExtractMessageFromRecordFn =
    Arc<dyn Fn(&Record, Option<&Value>) -> Result<Value, ConsumerError> + Send + Sync>;

/// Derives the content digests of a message/record/user-record triple.
pub type GenerateDigestsFn = Arc<
    dyn Fn(Option<&Value>, &Record, Option<&Value>) -> Result<Digests, ConsumerError>
        + Send
        + Sync,
>;

/// Resolves a record's event coordinates.
pub type ResolveEventCoordinatesFn = Arc<
    dyn Fn(&Record, Option<&Value>) -> Result<EventCoordinates, ConsumerError> + Send + Sync,
>;

/// Resolves a message's identity from the configured property names.
pub type ResolveMessageIdentityFn = Arc<
    dyn Fn(&Value, &EventCoordinates, &ConsumerConfig) -> Result<MessageIdentity, ConsumerError>
        + Send
        + Sync,
>;

/// Loads the prior batch state for a key; `None` means no prior state.
pub type LoadBatchStateFn = Arc<
    dyn Fn(BatchKey) -> BoxFuture<'static, Result<Option<BatchStateItem>, ConsumerError>>
        + Send
        + Sync,
>;

/// Saves the batch state. Receives the item and the `previously_saved`
/// tri-state; resolves with the new `previously_saved` value.
pub type SaveBatchStateFn = Arc<
    dyn Fn(BatchStateItem, Option<bool>) -> BoxFuture<'static, Result<bool, ConsumerError>>
        + Send
        + Sync,
>;

/// Routes one unusable record to its dead-letter destination.
pub type DiscardUnusableRecordFn = Arc<
    dyn Fn(UnusableRecordEnvelope) -> BoxFuture<'static, Result<(), ConsumerError>> + Send + Sync,
>;

/// Routes one rejected message to its dead-letter destination.
pub type DiscardRejectedMessageFn = Arc<
    dyn Fn(RejectedMessageEnvelope) -> BoxFuture<'static, Result<(), ConsumerError>> + Send + Sync,
>;

/// A lifecycle hook invoked with the batch.
pub type BatchHookFn =
    Arc<dyn for<'a> Fn(&'a Batch) -> BoxFuture<'a, Result<(), ConsumerError>> + Send + Sync>;

/// The user-supplied hooks and task definitions of a stream consumer.
///
/// One of the two extraction callbacks is required; everything else
/// defaults to the built-in behaviour (identity/digest derivation, the
/// checkpoint codec, the dead-letter terminal actions).
#[derive(Clone, Default)]
pub struct ConsumerCallbacks {
    /// One-to-many message extraction (takes precedence when both are set)
    pub extract_messages_from_record: Option<ExtractMessagesFromRecordFn>,
    /// One-to-one message extraction
    pub extract_message_from_record: Option<ExtractMessageFromRecordFn>,
    /// Digest derivation override
    pub generate_digests: Option<GenerateDigestsFn>,
    /// Event-coordinate resolution override
    pub resolve_event_coordinates: Option<ResolveEventCoordinatesFn>,
    /// Message-identity resolution override
    pub resolve_message_identity: Option<ResolveMessageIdentityFn>,
    /// Checkpoint load override
    pub load_batch_state: Option<LoadBatchStateFn>,
    /// Checkpoint save override
    pub save_batch_state: Option<SaveBatchStateFn>,
    /// Unusable-record discard handler
    pub discard_unusable_record: Option<DiscardUnusableRecordFn>,
    /// Rejected-message discard handler
    pub discard_rejected_message: Option<DiscardRejectedMessageFn>,
    /// Hook run at the end of the initiate phase
    pub pre_process_batch: Option<BatchHookFn>,
    /// Hook run at the end of the process phase
    pub pre_finalise_batch: Option<BatchHookFn>,
    /// Hook run after the finalise phase
    pub post_finalise_batch: Option<BatchHookFn>,
    /// Process-one task definitions, executed per message along key chains
    pub process_one_task_defs: Vec<TaskDef>,
    /// Process-all task definitions, executed batch-wide as master tasks
    pub process_all_task_defs: Vec<TaskDef>,
}

impl std::fmt::Debug for ConsumerCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerCallbacks")
            .field("extract_messages_from_record", &self.extract_messages_from_record.is_some())
            .field("extract_message_from_record", &self.extract_message_from_record.is_some())
            .field("generate_digests", &self.generate_digests.is_some())
            .field("resolve_event_coordinates", &self.resolve_event_coordinates.is_some())
            .field("resolve_message_identity", &self.resolve_message_identity.is_some())
            .field("load_batch_state", &self.load_batch_state.is_some())
            .field("save_batch_state", &self.save_batch_state.is_some())
            .field("discard_unusable_record", &self.discard_unusable_record.is_some())
            .field("discard_rejected_message", &self.discard_rejected_message.is_some())
            .field("pre_process_batch", &self.pre_process_batch.is_some())
            .field("pre_finalise_batch", &self.pre_finalise_batch.is_some())
            .field("post_finalise_batch", &self.post_finalise_batch.is_some())
            .field("process_one_task_defs", &self.process_one_task_defs.len())
            .field("process_all_task_defs", &self.process_all_task_defs.len())
            .finish()
    }
}

impl ConsumerCallbacks {
    /// Validates the callback record. A missing extraction callback is
    /// fatal.
    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.extract_messages_from_record.is_none() && self.extract_message_from_record.is_none()
        {
            return Err(ConsumerError::fatal(
                "Either extract_messages_from_record or extract_message_from_record is required",
            ));
        }
        Ok(())
    }

    /// Extracts the messages of one record through whichever extraction
    /// callback is configured.
    pub fn extract(&self, record: &Record) -> Result<Vec<ExtractedMessage>, ConsumerError> {
        if let Some(extract_many) = &self.extract_messages_from_record {
            return extract_many(record);
        }
        if let Some(extract_one) = &self.extract_message_from_record {
            let message = extract_one(record, None)?;
            return Ok(vec![ExtractedMessage { message, user_record: None }]);
        }
        Err(ConsumerError::fatal("No message extraction callback configured"))
    }
}
