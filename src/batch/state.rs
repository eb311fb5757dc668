//! Per-item tracked state and its storable projections.
//!
//! Every item a batch owns (message, rejected message, unusable record, and
//! the batch itself) carries a tracked state holding its identity, digests,
//! event coordinates and task maps. The `Stored*` types are the projections
//! written to the checkpoint table: transient pointers and cached joined
//! projections are stripped, task trees are reduced to snapshots, and items
//! without any usable identifier keep a safely-copied original for
//! content-based matching on restore.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ConsumerConfig;
use crate::error::ConsumerError;
use crate::identify::{Digests, EventCoordinates, MessageIdentity, NamedValue};
use crate::lambda::{InvocationContext, Record};
use crate::task::{Task, TaskSnapshot};

/// The primary checkpoint key of a batch:
/// `(streamConsumerId, shardOrEventID)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchKey {
    /// `{K|D}|{streamName}|{consumerId}`; DynamoDB streams embed
    /// `{tableName}/{streamTimestamp}` as the stream name
    #[serde(rename = "streamConsumerId")]
    pub stream_consumer_id: String,
    /// `S|{shardId}` or `E|{eventID}`
    #[serde(rename = "shardOrEventID")]
    pub shard_or_event_id: String,
}

impl BatchKey {
    /// Creates a BatchKey from its two components.
    pub fn new(
        stream_consumer_id: impl Into<String>,
        shard_or_event_id: impl Into<String>,
    ) -> Self {
        Self {
            stream_consumer_id: stream_consumer_id.into(),
            shard_or_event_id: shard_or_event_id.into(),
        }
    }

    /// Returns true if both key components are non-blank.
    pub fn is_valid(&self) -> bool {
        !self.stream_consumer_id.trim().is_empty() && !self.shard_or_event_id.trim().is_empty()
    }

    /// Resolves the batch key from the first record of the inbound batch.
    ///
    /// Kinesis batches are keyed on the shard id derived from the first
    /// record's event identifier unless `batch_keyed_on_event_id` forces
    /// event-id keying; DynamoDB Streams batches are always keyed on the
    /// first record's event identifier.
    pub fn resolve(
        records: &[Record],
        config: &ConsumerConfig,
        context: &dyn InvocationContext,
    ) -> Result<Self, ConsumerError> {
        let first = records
            .first()
            .ok_or_else(|| ConsumerError::validation("Cannot resolve a batch key without records"))?;

        let consumer_id = config.resolve_consumer_id(context)?;
        let stream_consumer_id = if config.stream_type.is_dynamodb() {
            let table = first.source_stream_name().ok_or_else(|| {
                ConsumerError::fatal("DynamoDB record has no table name in its event source ARN")
            })?;
            let timestamp = first.source_stream_timestamp().ok_or_else(|| {
                ConsumerError::fatal("DynamoDB record has no stream timestamp in its event source ARN")
            })?;
            format!("D|{table}/{timestamp}|{consumer_id}")
        } else {
            let stream = first.source_stream_name().ok_or_else(|| {
                ConsumerError::fatal("Record has no stream name in its event source ARN")
            })?;
            format!("K|{stream}|{consumer_id}")
        };

        let shard_or_event_id = if config.stream_type.is_kinesis() && !config.batch_keyed_on_event_id
        {
            match first.shard_id() {
                Some(shard) => format!("S|{shard}"),
                None => Self::event_keyed(first)?,
            }
        } else {
            Self::event_keyed(first)?
        };

        Ok(Self { stream_consumer_id, shard_or_event_id })
    }

    fn event_keyed(record: &Record) -> Result<String, ConsumerError> {
        let event_id = record
            .event_id()
            .ok_or_else(|| ConsumerError::fatal("First record has no eventID to key the batch on"))?;
        Ok(format!("E|{event_id}"))
    }
}

impl std::fmt::Display for BatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.stream_consumer_id, self.shard_or_event_id)
    }
}

/// Live tracked state of one message (or rejected message).
#[derive(Debug, Clone)]
pub struct MessageItem {
    /// The extracted message
    pub message: Value,
    /// Index of the originating record in the batch's record slice
    pub record_index: Option<usize>,
    /// The user record, for de-aggregated records
    pub user_record: Option<Value>,
    /// The resolved identity
    pub identity: MessageIdentity,
    /// The record's event coordinates
    pub coords: EventCoordinates,
    /// The content digests
    pub digests: Digests,
    /// Short description for log lines
    pub description: String,
    /// Process-one tasks, by task name
    pub ones: BTreeMap<String, Task>,
    /// Per-message mirrors of the batch-wide process-all tasks
    pub alls: BTreeMap<String, Task>,
    /// Discard-rejected-message tasks
    pub discards: BTreeMap<String, Task>,
    /// Index of the previous message in this item's key chain
    pub prev_message: Option<usize>,
    /// Index of the next message in this item's key chain
    pub next_message: Option<usize>,
    /// The rejection reason, once rejected
    pub reason_rejected: Option<String>,
    /// Prior stored state matched during restore; input to task revival
    pub prior: Option<StoredMessageState>,
}

impl MessageItem {
    /// Returns true if every one of this item's task trees is terminal.
    pub fn is_fully_finalised(&self) -> bool {
        self.ones.values().all(Task::is_fully_finalised)
            && self.alls.values().all(Task::is_fully_finalised)
            && self.discards.values().all(Task::is_fully_finalised)
    }

    /// Returns true if any process-one or process-all tree carries a
    /// rejection-family outcome.
    pub fn contains_rejection(&self) -> bool {
        self.ones.values().any(Task::contains_rejection)
            || self.alls.values().any(Task::contains_rejection)
    }
}

/// Live tracked state of one unusable record.
#[derive(Debug, Clone)]
pub struct UnusableItem {
    /// Index of the record in the batch's record slice
    pub record_index: Option<usize>,
    /// The user record, for de-aggregated records
    pub user_record: Option<Value>,
    /// Event coordinates, when they could be resolved
    pub coords: Option<EventCoordinates>,
    /// The content digests
    pub digests: Digests,
    /// Why the record is unusable
    pub reason_unusable: String,
    /// Discard-unusable-record tasks
    pub discards: BTreeMap<String, Task>,
    /// Prior stored state matched during restore; input to task revival
    pub prior: Option<StoredUnusableRecordState>,
}

impl UnusableItem {
    /// Returns true if every discard task tree is terminal.
    pub fn is_fully_finalised(&self) -> bool {
        self.discards.values().all(Task::is_fully_finalised)
    }
}

/// Live tracked state of the batch itself: the batch-wide master tasks and
/// the three phase task maps.
#[derive(Debug, Clone, Default)]
pub struct BatchTrackedState {
    /// Master process-all tasks, mirrored onto per-message `alls`
    pub alls: BTreeMap<String, Task>,
    /// Initiate-phase tasks
    pub initiating: BTreeMap<String, Task>,
    /// Process-phase tasks
    pub processing: BTreeMap<String, Task>,
    /// Finalise-phase tasks
    pub finalising: BTreeMap<String, Task>,
    /// Prior stored state loaded from the checkpoint table
    pub prior: Option<StoredBatchState>,
}

/// Storable projection of a message state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredMessageState {
    /// The id name-value pairs
    #[serde(rename = "ids", default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<NamedValue>,
    /// The key name-value pairs
    #[serde(rename = "keys", default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<NamedValue>,
    /// The sequence-number name-value pairs
    #[serde(rename = "seqNos", default, skip_serializing_if = "Vec::is_empty")]
    pub seq_nos: Vec<NamedValue>,
    /// The content digests
    #[serde(rename = "md5s", default)]
    pub md5s: Digests,
    /// The record's event identifier
    #[serde(rename = "eventID", default, skip_serializing_if = "String::is_empty")]
    pub event_id: String,
    /// The record's event sequence number
    #[serde(rename = "eventSeqNo", default, skip_serializing_if = "String::is_empty")]
    pub event_seq_no: String,
    /// The sub-sequence number for de-aggregated records
    #[serde(rename = "eventSubSeqNo", skip_serializing_if = "Option::is_none")]
    pub event_sub_seq_no: Option<String>,
    /// Snapshots of the process-one tasks
    #[serde(rename = "ones", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ones: BTreeMap<String, TaskSnapshot>,
    /// Snapshots of the per-message process-all mirrors
    #[serde(rename = "alls", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub alls: BTreeMap<String, TaskSnapshot>,
    /// Snapshots of the discard tasks
    #[serde(rename = "discards", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub discards: BTreeMap<String, TaskSnapshot>,
    /// The rejection reason, for rejected messages
    #[serde(rename = "reasonRejected", skip_serializing_if = "Option::is_none")]
    pub reason_rejected: Option<String>,
    /// Safely-copied original message, attached only when the state lacks
    /// any usable identifier (enables content-based matching on restore)
    #[serde(rename = "message", skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    /// Safely-copied user record, same purpose as `message`
    #[serde(rename = "userRecord", skip_serializing_if = "Option::is_none")]
    pub user_record: Option<Value>,
    /// Safely-copied record, same purpose as `message`
    #[serde(rename = "record", skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,
}

/// Storable projection of an unusable-record state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredUnusableRecordState {
    /// The record's event identifier
    #[serde(rename = "eventID", default, skip_serializing_if = "String::is_empty")]
    pub event_id: String,
    /// The record's event sequence number
    #[serde(rename = "eventSeqNo", default, skip_serializing_if = "String::is_empty")]
    pub event_seq_no: String,
    /// The sub-sequence number for de-aggregated records
    #[serde(rename = "eventSubSeqNo", skip_serializing_if = "Option::is_none")]
    pub event_sub_seq_no: Option<String>,
    /// The content digests
    #[serde(rename = "md5s", default)]
    pub md5s: Digests,
    /// Why the record is unusable
    #[serde(rename = "reasonUnusable", default, skip_serializing_if = "String::is_empty")]
    pub reason_unusable: String,
    /// Snapshots of the discard tasks
    #[serde(rename = "discards", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub discards: BTreeMap<String, TaskSnapshot>,
    /// Safely-copied record, attached only when the state lacks any usable
    /// identifier
    #[serde(rename = "record", skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,
    /// Safely-copied user record, same purpose as `record`
    #[serde(rename = "userRecord", skip_serializing_if = "Option::is_none")]
    pub user_record: Option<Value>,
}

/// Storable projection of the batch's own state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredBatchState {
    /// Snapshots of the batch-wide master tasks
    #[serde(rename = "alls", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub alls: BTreeMap<String, TaskSnapshot>,
    /// Snapshots of the initiate-phase tasks
    #[serde(rename = "initiating", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub initiating: BTreeMap<String, TaskSnapshot>,
    /// Snapshots of the process-phase tasks
    #[serde(rename = "processing", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub processing: BTreeMap<String, TaskSnapshot>,
    /// Snapshots of the finalise-phase tasks
    #[serde(rename = "finalising", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub finalising: BTreeMap<String, TaskSnapshot>,
}

impl StoredBatchState {
    /// Returns true if no task snapshot is carried at all.
    pub fn is_empty(&self) -> bool {
        self.alls.is_empty()
            && self.initiating.is_empty()
            && self.processing.is_empty()
            && self.finalising.is_empty()
    }
}

/// The checkpoint-table item for one batch key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchStateItem {
    /// The hash key
    #[serde(rename = "streamConsumerId")]
    pub stream_consumer_id: String,
    /// The range key
    #[serde(rename = "shardOrEventID")]
    pub shard_or_event_id: String,
    /// Stored states of the batch's messages
    #[serde(rename = "messageStates", default)]
    pub message_states: Vec<StoredMessageState>,
    /// Stored states of the batch's rejected messages
    #[serde(rename = "rejectedMessageStates", default)]
    pub rejected_message_states: Vec<StoredMessageState>,
    /// Stored states of the batch's unusable records
    #[serde(rename = "unusableRecordStates", default)]
    pub unusable_record_states: Vec<StoredUnusableRecordState>,
    /// Stored state of the batch itself
    #[serde(rename = "batchState", skip_serializing_if = "Option::is_none")]
    pub batch_state: Option<StoredBatchState>,
}

impl BatchStateItem {
    /// Returns the item's batch key.
    pub fn key(&self) -> BatchKey {
        BatchKey::new(&self.stream_consumer_id, &self.shard_or_event_id)
    }
}
