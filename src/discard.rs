//! Terminal actions: dead-letter routing and the fatal-error escape hatch.
//!
//! Unusable records are published to the dead-record stream (DRQ) and
//! rejected messages to the dead-message stream (DMQ), each wrapped in an
//! envelope carrying the batch key and every available identifier. On a
//! fatal error the upstream event-source mapping is disabled so the host
//! stops delivering records until an operator intervenes; the mapping's
//! identifier is cached per process and invalidated on error.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::batch::state::BatchKey;
use crate::client::{DeadLetterStreamClient, EventSourceControlClient};
use crate::error::ConsumerError;
use crate::identify::Digests;

/// Envelope published to the dead-record stream for one unusable record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnusableRecordEnvelope {
    /// The owning batch's stream-consumer id
    #[serde(rename = "streamConsumerId")]
    pub stream_consumer_id: String,
    /// The owning batch's shard-or-event id
    #[serde(rename = "shardOrEventID")]
    pub shard_or_event_id: String,
    /// The record's event identifier, when known
    #[serde(rename = "eventID", skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// The record's event sequence number, when known
    #[serde(rename = "eventSeqNo", skip_serializing_if = "Option::is_none")]
    pub event_seq_no: Option<String>,
    /// Content digests of the record
    #[serde(rename = "md5s", default)]
    pub md5s: Digests,
    /// Why the record is unusable
    #[serde(rename = "reasonUnusable")]
    pub reason_unusable: String,
    /// The unusable record itself
    #[serde(rename = "record", skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,
    /// The user record, for de-aggregated records
    #[serde(rename = "userRecord", skip_serializing_if = "Option::is_none")]
    pub user_record: Option<Value>,
    /// When the discard was performed
    #[serde(rename = "discardedAt")]
    pub discarded_at: String,
}

impl UnusableRecordEnvelope {
    /// The partition key under which to publish this envelope.
    pub fn partition_key(&self) -> String {
        self.event_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string())
    }
}

/// Envelope published to the dead-message stream for one rejected message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedMessageEnvelope {
    /// The owning batch's stream-consumer id
    #[serde(rename = "streamConsumerId")]
    pub stream_consumer_id: String,
    /// The owning batch's shard-or-event id
    #[serde(rename = "shardOrEventID")]
    pub shard_or_event_id: String,
    /// The message's joined id projection
    #[serde(rename = "id", skip_serializing_if = "String::is_empty", default)]
    pub id: String,
    /// The message's joined key projection
    #[serde(rename = "key", skip_serializing_if = "String::is_empty", default)]
    pub key: String,
    /// The message's joined sequence-number projection
    #[serde(rename = "seqNo", skip_serializing_if = "String::is_empty", default)]
    pub seq_no: String,
    /// The rejected message itself
    #[serde(rename = "message")]
    pub message: Value,
    /// The record the message came from
    #[serde(rename = "record", skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,
    /// The user record, for de-aggregated records
    #[serde(rename = "userRecord", skip_serializing_if = "Option::is_none")]
    pub user_record: Option<Value>,
    /// Why the message was rejected
    #[serde(rename = "reasonRejected")]
    pub reason_rejected: String,
    /// When the discard was performed
    #[serde(rename = "discardedAt")]
    pub discarded_at: String,
}

impl RejectedMessageEnvelope {
    /// The partition key under which to publish this envelope.
    pub fn partition_key(&self) -> String {
        if !self.key.is_empty() {
            self.key.clone()
        } else if !self.id.is_empty() {
            self.id.clone()
        } else {
            Uuid::new_v4().to_string()
        }
    }
}

/// Returns the current time formatted for envelope timestamps.
pub fn discard_timestamp() -> String {
    Utc::now().to_rfc3339()
}

fn require_valid_key(
    stream_consumer_id: &str,
    shard_or_event_id: &str,
) -> Result<(), ConsumerError> {
    let key = BatchKey::new(stream_consumer_id, shard_or_event_id);
    if !key.is_valid() {
        return Err(ConsumerError::validation(format!(
            "Cannot discard without a valid batch key, got {key}"
        )));
    }
    Ok(())
}

/// Publishes one unusable-record envelope to the dead-record stream.
///
/// Requires a valid batch key; a publish failure fails the discard task so
/// the record is retried on redelivery.
pub async fn discard_unusable_record_to_drq(
    envelope: UnusableRecordEnvelope,
    client: &dyn DeadLetterStreamClient,
    stream_name: &str,
) -> Result<(), ConsumerError> {
    require_valid_key(&envelope.stream_consumer_id, &envelope.shard_or_event_id)?;
    let partition_key = envelope.partition_key();
    let data = serde_json::to_string(&envelope)?;
    client.put_record(stream_name, &partition_key, &data).await?;
    info!(
        stream = stream_name,
        event_id = envelope.event_id.as_deref().unwrap_or("-"),
        "Discarded unusable record to DRQ"
    );
    Ok(())
}

/// Publishes one rejected-message envelope to the dead-message stream.
pub async fn discard_rejected_message_to_dmq(
    envelope: RejectedMessageEnvelope,
    client: &dyn DeadLetterStreamClient,
    stream_name: &str,
) -> Result<(), ConsumerError> {
    require_valid_key(&envelope.stream_consumer_id, &envelope.shard_or_event_id)?;
    let partition_key = envelope.partition_key();
    let data = serde_json::to_string(&envelope)?;
    client.put_record(stream_name, &partition_key, &data).await?;
    info!(stream = stream_name, id = %envelope.id, "Discarded rejected message to DMQ");
    Ok(())
}

fn mapping_id_cache() -> &'static Mutex<HashMap<String, String>> {
    static CACHE: OnceLock<Mutex<HashMap<String, String>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn cache_key(function_name: &str, source_stream_name: &str) -> String {
    format!("{function_name}|{source_stream_name}")
}

fn cached_mapping_id(function_name: &str, source_stream_name: &str) -> Option<String> {
    mapping_id_cache()
        .lock()
        .ok()
        .and_then(|cache| cache.get(&cache_key(function_name, source_stream_name)).cloned())
}

fn cache_mapping_id(function_name: &str, source_stream_name: &str, uuid: &str) {
    if let Ok(mut cache) = mapping_id_cache().lock() {
        cache.insert(cache_key(function_name, source_stream_name), uuid.to_string());
    }
}

/// Drops the cached mapping identifier for one function/stream pair.
pub fn invalidate_cached_mapping(function_name: &str, source_stream_name: &str) {
    if let Ok(mut cache) = mapping_id_cache().lock() {
        cache.remove(&cache_key(function_name, source_stream_name));
    }
}

/// Disables the event-source mapping that binds the source stream to the
/// consuming function.
///
/// The mapping identifier is resolved through the control plane's list API
/// and cached per process (unless `avoid_cache`); the cache entry is
/// invalidated when the disable call fails.
pub async fn disable_source_stream_event_source_mapping(
    client: &dyn EventSourceControlClient,
    function_name: &str,
    source_stream_name: &str,
    avoid_cache: bool,
) -> Result<(), ConsumerError> {
    let cached = if avoid_cache { None } else { cached_mapping_id(function_name, source_stream_name) };

    let uuid = match cached {
        Some(uuid) => uuid,
        None => {
            let mappings = client.list_event_source_mappings(function_name).await?;
            let mapping = mappings
                .iter()
                .find(|m| m.event_source_arn.contains(source_stream_name))
                .ok_or_else(|| {
                    ConsumerError::fatal(format!(
                        "No event-source mapping found for function '{function_name}' and stream '{source_stream_name}'"
                    ))
                })?;
            mapping.uuid.clone()
        }
    };

    match client.disable_event_source_mapping(&uuid).await {
        Ok(()) => {
            cache_mapping_id(function_name, source_stream_name, &uuid);
            warn!(
                function = function_name,
                stream = source_stream_name,
                uuid = %uuid,
                "Disabled event-source mapping"
            );
            Ok(())
        }
        Err(disable_error) => {
            invalidate_cached_mapping(function_name, source_stream_name);
            Err(disable_error)
        }
    }
}

/// Handles a fatal error by disabling the upstream event-source mapping,
/// then hands the original error back to be re-raised.
///
/// The disable is best-effort: its own failure is logged but never masks
/// the fatal error.
pub async fn handle_fatal_error(
    fatal: ConsumerError,
    client: &dyn EventSourceControlClient,
    function_name: &str,
    source_stream_name: &str,
    avoid_cache: bool,
) -> ConsumerError {
    error!(%fatal, "Fatal error; disabling the source stream's event-source mapping");
    if let Err(disable_error) = disable_source_stream_event_source_mapping(
        client,
        function_name,
        source_stream_name,
        avoid_cache,
    )
    .await
    {
        error!(%disable_error, "Failed to disable the event-source mapping");
    }
    fatal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::EventSourceMappingSummary;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingStreamClient {
        records: Mutex<Vec<(String, String, String)>>,
        fail: bool,
    }

    impl RecordingStreamClient {
        fn new(fail: bool) -> Self {
            Self { records: Mutex::new(Vec::new()), fail }
        }
    }

    #[async_trait]
    impl DeadLetterStreamClient for RecordingStreamClient {
        async fn put_record(
            &self,
            stream_name: &str,
            partition_key: &str,
            data: &str,
        ) -> Result<(), ConsumerError> {
            if self.fail {
                return Err(ConsumerError::store_retriable("stream down", None));
            }
            self.records.lock().unwrap().push((
                stream_name.to_string(),
                partition_key.to_string(),
                data.to_string(),
            ));
            Ok(())
        }
    }

    struct FakeControlClient {
        list_calls: AtomicUsize,
        disable_calls: Mutex<Vec<String>>,
        fail_disable: bool,
    }

    impl FakeControlClient {
        fn new(fail_disable: bool) -> Self {
            Self {
                list_calls: AtomicUsize::new(0),
                disable_calls: Mutex::new(Vec::new()),
                fail_disable,
            }
        }
    }

    #[async_trait]
    impl EventSourceControlClient for FakeControlClient {
        async fn list_event_source_mappings(
            &self,
            _function_name: &str,
        ) -> Result<Vec<EventSourceMappingSummary>, ConsumerError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![EventSourceMappingSummary {
                uuid: "uuid-1".to_string(),
                state: "Enabled".to_string(),
                event_source_arn: "arn:aws:kinesis:us-east-1:1:stream/TestStream".to_string(),
                function_arn: "arn:aws:lambda:us-east-1:1:function:f".to_string(),
            }])
        }

        async fn disable_event_source_mapping(&self, uuid: &str) -> Result<(), ConsumerError> {
            if self.fail_disable {
                return Err(ConsumerError::store_retriable("control plane down", None));
            }
            self.disable_calls.lock().unwrap().push(uuid.to_string());
            Ok(())
        }
    }

    fn unusable_envelope() -> UnusableRecordEnvelope {
        UnusableRecordEnvelope {
            stream_consumer_id: "K|TestStream|c1".to_string(),
            shard_or_event_id: "S|shard-0".to_string(),
            event_id: Some("id-1".to_string()),
            event_seq_no: Some("1".to_string()),
            md5s: Digests::default(),
            reason_unusable: "could not decode".to_string(),
            record: Some(serde_json::json!({"eventID": "id-1"})),
            user_record: None,
            discarded_at: discard_timestamp(),
        }
    }

    #[tokio::test]
    async fn test_discard_unusable_record_publishes_envelope() {
        let client = RecordingStreamClient::new(false);
        discard_unusable_record_to_drq(unusable_envelope(), &client, "DeadRecordQueue_QA")
            .await
            .unwrap();

        let records = client.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        let (stream, partition_key, data) = &records[0];
        assert_eq!(stream, "DeadRecordQueue_QA");
        assert_eq!(partition_key, "id-1");
        assert!(data.contains("\"reasonUnusable\":\"could not decode\""));
        assert!(data.contains("\"streamConsumerId\":\"K|TestStream|c1\""));
    }

    #[tokio::test]
    async fn test_discard_requires_valid_batch_key() {
        let client = RecordingStreamClient::new(false);
        let mut envelope = unusable_envelope();
        envelope.stream_consumer_id = " ".to_string();
        let error = discard_unusable_record_to_drq(envelope, &client, "DRQ").await.unwrap_err();
        assert!(matches!(error, ConsumerError::Validation { .. }));
        assert!(client.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_discard_failure_surfaces() {
        let client = RecordingStreamClient::new(true);
        let error =
            discard_unusable_record_to_drq(unusable_envelope(), &client, "DRQ").await.unwrap_err();
        assert!(error.is_transient());
    }

    #[tokio::test]
    async fn test_discard_rejected_message_partition_key_prefers_key() {
        let client = RecordingStreamClient::new(false);
        let envelope = RejectedMessageEnvelope {
            stream_consumer_id: "K|TestStream|c1".to_string(),
            shard_or_event_id: "S|shard-0".to_string(),
            id: "id:1".to_string(),
            key: "k:K1".to_string(),
            seq_no: "n:1".to_string(),
            message: serde_json::json!({"k": "K1"}),
            record: None,
            user_record: None,
            reason_rejected: "retries exhausted".to_string(),
            discarded_at: discard_timestamp(),
        };
        discard_rejected_message_to_dmq(envelope, &client, "DMQ").await.unwrap();
        let records = client.records.lock().unwrap();
        assert_eq!(records[0].1, "k:K1");
    }

    #[tokio::test]
    async fn test_disable_mapping_caches_identifier() {
        let client = FakeControlClient::new(false);
        invalidate_cached_mapping("fn-cache-test", "TestStream");

        disable_source_stream_event_source_mapping(&client, "fn-cache-test", "TestStream", false)
            .await
            .unwrap();
        disable_source_stream_event_source_mapping(&client, "fn-cache-test", "TestStream", false)
            .await
            .unwrap();

        // The second call reuses the cached identifier.
        assert_eq!(client.list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.disable_calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_disable_mapping_avoid_cache_always_lists() {
        let client = FakeControlClient::new(false);
        invalidate_cached_mapping("fn-avoid-cache", "TestStream");

        disable_source_stream_event_source_mapping(&client, "fn-avoid-cache", "TestStream", true)
            .await
            .unwrap();
        disable_source_stream_event_source_mapping(&client, "fn-avoid-cache", "TestStream", true)
            .await
            .unwrap();
        assert_eq!(client.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disable_failure_invalidates_cache() {
        let ok_client = FakeControlClient::new(false);
        invalidate_cached_mapping("fn-invalidate", "TestStream");
        disable_source_stream_event_source_mapping(&ok_client, "fn-invalidate", "TestStream", false)
            .await
            .unwrap();

        let failing = FakeControlClient::new(true);
        let error = disable_source_stream_event_source_mapping(
            &failing,
            "fn-invalidate",
            "TestStream",
            false,
        )
        .await
        .unwrap_err();
        assert!(error.is_transient());
        assert!(cached_mapping_id("fn-invalidate", "TestStream").is_none());
    }

    #[tokio::test]
    async fn test_handle_fatal_error_returns_original() {
        let client = FakeControlClient::new(false);
        invalidate_cached_mapping("fn-fatal", "TestStream");
        let fatal = ConsumerError::fatal("missing table");
        let returned =
            handle_fatal_error(fatal, &client, "fn-fatal", "TestStream", false).await;
        assert!(returned.is_fatal());
        assert_eq!(client.disable_calls.lock().unwrap().len(), 1);
    }
}
