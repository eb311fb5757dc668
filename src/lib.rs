//! # Stream Consumer Core
//!
//! The core execution engine of a resilient, at-least-once consumer for
//! partitioned event streams (Kinesis and DynamoDB Streams). Each
//! invocation receives a batch of records from a single shard-equivalent
//! and drives every record to a terminal outcome — successfully processed,
//! discarded as unusable, or discarded as rejected — while respecting
//! per-key ordering, bounded retry budgets and the host runtime's hard
//! wall-clock deadline. Progress is checkpointed to an external key-value
//! table so that a redelivered batch resumes exactly where the previous
//! invocation left off and never repeats finalized work.
//!
//! ## Overview
//!
//! A [`StreamConsumer`] runs three phases per invocation:
//!
//! 1. **Initiate** — extract messages from the records via the caller's
//!    extraction callback, resolve each message's identity (ids, keys,
//!    sequence numbers, content digests), sequence the messages into
//!    per-key chains, load any prior checkpoint and revive the persisted
//!    task trees onto the fresh batch.
//! 2. **Process** — run every key chain (a message's process-one tasks
//!    must fully finalise before its successor starts), run the
//!    batch-wide process-all tasks (masters mirrored onto per-message
//!    slaves), and discard unusable records to the dead-record stream —
//!    all raced against a deadline derived from the remaining time.
//! 3. **Finalise** — enforce the retry cap, freeze the processing trees,
//!    discard rejected messages to the dead-message stream, and save the
//!    checkpoint — always before the invocation's hard deadline.
//!
//! An invocation either acknowledges the batch (every item terminal) or
//! fails so the host redelivers the same records; a dead-lettered item
//! never comes back. Fatal errors additionally disable the upstream
//! event-source mapping to force operator attention.
//!
//! ## Getting started
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stream_consumer_core::{
//!     AwsRestClient, ConsumerCallbacks, ConsumerConfig, StreamConsumer, StreamEvent, TaskDef,
//! };
//!
//! let client = Arc::new(AwsRestClient::from_env().await?);
//! let config = ConsumerConfig {
//!     stage: "qa".to_string(),
//!     key_property_names: vec!["customerId".to_string()],
//!     seq_no_property_names: vec!["version".to_string()],
//!     ..ConsumerConfig::default()
//! };
//! let callbacks = ConsumerCallbacks {
//!     extract_message_from_record: Some(Arc::new(|record, _| {
//!         // Decode the record payload into a message.
//!         Ok(serde_json::from_slice(&record.decoded_data()?.unwrap_or_default())?)
//!     })),
//!     process_one_task_defs: vec![TaskDef::new(
//!         "applyChange",
//!         Arc::new(|input| Box::pin(async move {
//!             // Process one message.
//!             Ok(serde_json::Value::Null)
//!         })),
//!     )?],
//!     ..ConsumerCallbacks::default()
//! };
//! let consumer =
//!     StreamConsumer::new(config, callbacks, client.clone(), client.clone(), client)?;
//!
//! // Per invocation:
//! let summary = consumer.process_batch(event, &context).await?;
//! ```
//!
//! ## Module organization
//!
//! - [`batch`]: the batch aggregate and its tracked state
//! - [`checkpoint`]: the checkpoint codec (serialize, restore, persist)
//! - [`client`]: cloud facade traits and the SigV4 REST implementation
//! - [`config`]: configuration and user-callback records
//! - [`discard`]: dead-letter terminal actions and the fatal escape hatch
//! - [`error`]: the crate error hierarchy
//! - [`identify`]: message identity, digests and event coordinates
//! - [`lambda`]: the host runtime surface (records, invocation context)
//! - [`phases`]: the three-phase orchestrator
//! - [`sequence`]: per-key sequencing and the sequence comparator
//! - [`task`]: the hierarchical task engine

pub mod batch;
pub mod checkpoint;
pub mod client;
pub mod config;
pub mod discard;
pub mod error;
pub mod identify;
pub mod lambda;
pub mod phases;
pub mod sequence;
pub mod task;

pub use batch::state::{
    BatchKey, BatchStateItem, MessageItem, StoredBatchState, StoredMessageState,
    StoredUnusableRecordState, UnusableItem,
};
pub use batch::{
    AddMessageOutcome, Batch, BatchProgress, BatchSummary, TaskDefs,
    DISCARD_REJECTED_MESSAGE_TASK, DISCARD_UNUSABLE_RECORD_TASK, FINALISE_BATCH_TASK,
    INITIATE_BATCH_TASK, PROCESS_BATCH_TASK,
};
pub use checkpoint::{restore_batch, serialize_batch, CheckpointCodec};
pub use client::{
    AwsClientConfig, AwsRestClient, CheckpointStoreClient, DeadLetterStreamClient,
    EventSourceControlClient, EventSourceMappingSummary,
};
pub use config::{ConsumerCallbacks, ConsumerConfig, ExtractedMessage, StreamType};
pub use discard::{
    disable_source_stream_event_source_mapping, discard_rejected_message_to_dmq,
    discard_unusable_record_to_drq, handle_fatal_error, RejectedMessageEnvelope,
    UnusableRecordEnvelope,
};
pub use error::{AwsError, ConsumerError, ErrorInfo};
pub use identify::{Digests, EventCoordinates, MessageIdentity, NamedValue};
pub use lambda::{FixedInvocationContext, InvocationContext, Record, StreamEvent};
pub use phases::StreamConsumer;
pub use sequence::{SortKind, SortValue, SortablePart};
pub use task::{
    BatchScope, CompleteOpts, ExecuteFn, MessageScope, ReviveMode, Task, TaskDef, TaskInput,
    TaskOutcome, TaskOutcomeKind, TaskSnapshot, TaskStateKind, TaskStateSnapshot, TimeoutOpts,
};
