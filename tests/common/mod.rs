//! Shared mock clients and builders for the lifecycle tests.
//!
//! The mocks mirror the real facades: an in-memory checkpoint store with
//! conditional-write semantics, a recording dead-letter stream and a
//! recording event-source control plane. All record calls for later
//! verification.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use stream_consumer_core::{
    AwsError, BatchKey, BatchStateItem, CheckpointStoreClient, ConsumerCallbacks, ConsumerConfig,
    ConsumerError, DeadLetterStreamClient, EventSourceControlClient, EventSourceMappingSummary,
    FixedInvocationContext, Record, StreamConsumer,
};

/// In-memory checkpoint store with conditional-write semantics.
#[derive(Default)]
pub struct MockCheckpointStore {
    items: Mutex<HashMap<(String, String), BatchStateItem>>,
    /// Scripted errors returned (once each) before real behaviour resumes
    fail_next: Mutex<VecDeque<ConsumerError>>,
    get_calls: AtomicUsize,
    /// The `expect_existing` flag of every put call, in order
    put_modes: Mutex<Vec<bool>>,
}

impl MockCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeds the store with an item.
    pub fn seed(&self, item: BatchStateItem) {
        self.items
            .lock()
            .unwrap()
            .insert((item.stream_consumer_id.clone(), item.shard_or_event_id.clone()), item);
    }

    /// Queues an error to be returned by the next store call.
    pub fn fail_next(&self, error: ConsumerError) {
        self.fail_next.lock().unwrap().push_back(error);
    }

    /// Returns the stored item for a key, if any.
    pub fn item_for(&self, key: &BatchKey) -> Option<BatchStateItem> {
        self.items
            .lock()
            .unwrap()
            .get(&(key.stream_consumer_id.clone(), key.shard_or_event_id.clone()))
            .cloned()
    }

    /// Number of get calls made.
    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    /// The `expect_existing` flags of every put call.
    pub fn put_modes(&self) -> Vec<bool> {
        self.put_modes.lock().unwrap().clone()
    }
}

#[async_trait]
impl CheckpointStoreClient for MockCheckpointStore {
    async fn get_batch_state(
        &self,
        _table_name: &str,
        key: &BatchKey,
    ) -> Result<Option<BatchStateItem>, ConsumerError> {
        if let Some(error) = self.fail_next.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.item_for(key))
    }

    async fn put_batch_state(
        &self,
        _table_name: &str,
        item: &BatchStateItem,
        expect_existing: bool,
    ) -> Result<(), ConsumerError> {
        if let Some(error) = self.fail_next.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.put_modes.lock().unwrap().push(expect_existing);
        let key = (item.stream_consumer_id.clone(), item.shard_or_event_id.clone());
        let mut items = self.items.lock().unwrap();
        if items.contains_key(&key) != expect_existing {
            return Err(ConsumerError::store_non_retriable(
                "The conditional request failed",
                Some(AwsError::new(
                    "ConditionalCheckFailedException",
                    "The conditional request failed",
                )),
            ));
        }
        items.insert(key, item.clone());
        Ok(())
    }
}

/// One record published to a mock dead-letter stream.
#[derive(Debug, Clone)]
pub struct PublishedRecord {
    pub stream_name: String,
    pub partition_key: String,
    pub data: String,
}

/// Recording dead-letter stream client.
#[derive(Default)]
pub struct MockDeadLetterStream {
    published: Mutex<Vec<PublishedRecord>>,
}

impl MockDeadLetterStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// All published records, in order.
    pub fn published(&self) -> Vec<PublishedRecord> {
        self.published.lock().unwrap().clone()
    }

    /// Number of records published to one stream.
    pub fn count_for(&self, stream_name: &str) -> usize {
        self.published.lock().unwrap().iter().filter(|p| p.stream_name == stream_name).count()
    }
}

#[async_trait]
impl DeadLetterStreamClient for MockDeadLetterStream {
    async fn put_record(
        &self,
        stream_name: &str,
        partition_key: &str,
        data: &str,
    ) -> Result<(), ConsumerError> {
        self.published.lock().unwrap().push(PublishedRecord {
            stream_name: stream_name.to_string(),
            partition_key: partition_key.to_string(),
            data: data.to_string(),
        });
        Ok(())
    }
}

/// Recording event-source control plane.
pub struct MockEventSourceControl {
    mappings: Vec<EventSourceMappingSummary>,
    disabled: Mutex<Vec<String>>,
}

impl MockEventSourceControl {
    pub fn with_stream(stream_name: &str) -> Self {
        Self {
            mappings: vec![EventSourceMappingSummary {
                uuid: "esm-uuid-1".to_string(),
                state: "Enabled".to_string(),
                event_source_arn: format!(
                    "arn:aws:kinesis:us-west-2:111111111111:stream/{stream_name}"
                ),
                function_arn: "arn:aws:lambda:us-west-2:111111111111:function:consumer".to_string(),
            }],
            disabled: Mutex::new(Vec::new()),
        }
    }

    /// UUIDs of the mappings disabled so far.
    pub fn disabled(&self) -> Vec<String> {
        self.disabled.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSourceControlClient for MockEventSourceControl {
    async fn list_event_source_mappings(
        &self,
        _function_name: &str,
    ) -> Result<Vec<EventSourceMappingSummary>, ConsumerError> {
        Ok(self.mappings.clone())
    }

    async fn disable_event_source_mapping(&self, uuid: &str) -> Result<(), ConsumerError> {
        self.disabled.lock().unwrap().push(uuid.to_string());
        Ok(())
    }
}

/// A Kinesis-shaped record whose body carries a key and sequence value.
pub fn kinesis_record(seq_no: u64, key: &str, n: i64) -> Record {
    Record::new(json!({
        "eventID": format!("shardId-000000000000:{seq_no}"),
        "eventSource": "aws:kinesis",
        "eventSourceARN": "arn:aws:kinesis:us-west-2:111111111111:stream/TestStream",
        "kinesis": {
            "partitionKey": key,
            "sequenceNumber": seq_no.to_string(),
        },
        "body": {"k": key, "n": n}
    }))
}

/// A Kinesis-shaped record with no decodable body.
pub fn undecodable_record(seq_no: u64) -> Record {
    Record::new(json!({
        "eventID": format!("shardId-000000000000:{seq_no}"),
        "eventSource": "aws:kinesis",
        "eventSourceARN": "arn:aws:kinesis:us-west-2:111111111111:stream/TestStream",
        "kinesis": {"sequenceNumber": seq_no.to_string()}
    }))
}

/// An invocation context with the given time budget.
pub fn context(budget: std::time::Duration) -> FixedInvocationContext {
    FixedInvocationContext::new("consumer", "live", budget)
}

/// Base configuration for the lifecycle tests: key property `k`, sequence
/// property `n`, retry cap 2.
pub fn test_config() -> ConsumerConfig {
    ConsumerConfig {
        consumer_id: Some("c1".to_string()),
        key_property_names: vec!["k".to_string()],
        seq_no_property_names: vec!["n".to_string()],
        max_number_of_attempts: 2,
        ..ConsumerConfig::default()
    }
}

/// Base callbacks: extract the record's `body` property as the message.
pub fn test_callbacks() -> ConsumerCallbacks {
    ConsumerCallbacks {
        extract_message_from_record: Some(Arc::new(|record, _| {
            record
                .as_value()
                .get("body")
                .cloned()
                .ok_or_else(|| ConsumerError::unusable("Record has no body"))
        })),
        ..ConsumerCallbacks::default()
    }
}

/// A consumer wired to fresh mocks, kept for inspection.
pub struct Harness {
    pub store: Arc<MockCheckpointStore>,
    pub dead_letters: Arc<MockDeadLetterStream>,
    pub event_source_control: Arc<MockEventSourceControl>,
    pub consumer: StreamConsumer,
}

impl Harness {
    pub fn new(config: ConsumerConfig, callbacks: ConsumerCallbacks) -> Self {
        let store = Arc::new(MockCheckpointStore::new());
        let dead_letters = Arc::new(MockDeadLetterStream::new());
        let event_source_control = Arc::new(MockEventSourceControl::with_stream("TestStream"));
        let consumer = StreamConsumer::new(
            config,
            callbacks,
            store.clone(),
            dead_letters.clone(),
            event_source_control.clone(),
        )
        .expect("consumer construction");
        Self { store, dead_letters, event_source_control, consumer }
    }
}
