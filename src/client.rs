//! Cloud facade clients for the stream consumer core.
//!
//! Three traits abstract the external collaborators so tests can supply
//! mocks: [`CheckpointStoreClient`] (the batch-state table),
//! [`DeadLetterStreamClient`] (the dead-record and dead-message streams)
//! and [`EventSourceControlClient`] (the event-source-mapping control
//! plane). [`AwsRestClient`] implements all three against the DynamoDB,
//! Kinesis and Lambda REST APIs with SigV4-signed requests.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use aws_credential_types::provider::ProvideCredentials;
use aws_sigv4::http_request::{sign, SignableBody, SignableRequest, SigningSettings};
use aws_sigv4::sign::v4;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::batch::state::{BatchKey, BatchStateItem};
use crate::error::{AwsError, ConsumerError};

/// Error codes from the checkpoint store that are retriable.
const RETRIABLE_STORE_ERROR_CODES: &[&str] = &[
    "ProvisionedThroughputExceededException",
    "ThrottlingException",
    "LimitExceededException",
    "ItemCollectionSizeLimitExceededException",
    "InternalServerError",
    "ServiceUnavailable",
];

/// Returns true if the given store error code is retriable.
pub fn is_retriable_store_error_code(code: &str) -> bool {
    RETRIABLE_STORE_ERROR_CODES.iter().any(|retriable| code.contains(retriable))
}

/// Trait for reading and writing the batch-state checkpoint table.
#[async_trait]
pub trait CheckpointStoreClient: Send + Sync {
    /// Loads the prior batch state for a key with strong consistency and a
    /// restricted projection. `None` means no prior state exists.
    async fn get_batch_state(
        &self,
        table_name: &str,
        key: &BatchKey,
    ) -> Result<Option<BatchStateItem>, ConsumerError>;

    /// Writes the batch state conditionally: with `expect_existing` the
    /// write requires the item to already exist (update); without, it
    /// requires the item to be absent (insert). A conditional-check failure
    /// surfaces as a [`ConsumerError::Store`] whose
    /// `is_conditional_check_failed()` returns true.
    async fn put_batch_state(
        &self,
        table_name: &str,
        item: &BatchStateItem,
        expect_existing: bool,
    ) -> Result<(), ConsumerError>;
}

/// Trait for publishing to the append-only dead-letter streams.
#[async_trait]
pub trait DeadLetterStreamClient: Send + Sync {
    /// Publishes one envelope to the named stream.
    async fn put_record(
        &self,
        stream_name: &str,
        partition_key: &str,
        data: &str,
    ) -> Result<(), ConsumerError>;
}

/// Summary of one event-source mapping as returned by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSourceMappingSummary {
    /// The mapping's identifier
    #[serde(rename = "UUID")]
    pub uuid: String,
    /// The mapping's state (e.g. `Enabled`, `Disabled`)
    #[serde(rename = "State", default)]
    pub state: String,
    /// The source stream's ARN
    #[serde(rename = "EventSourceArn", default)]
    pub event_source_arn: String,
    /// The consuming function's ARN
    #[serde(rename = "FunctionArn", default)]
    pub function_arn: String,
}

/// Trait for the event-source-mapping control plane.
#[async_trait]
pub trait EventSourceControlClient: Send + Sync {
    /// Lists the event-source mappings of a function.
    async fn list_event_source_mappings(
        &self,
        function_name: &str,
    ) -> Result<Vec<EventSourceMappingSummary>, ConsumerError>;

    /// Disables the mapping with the given identifier.
    async fn disable_event_source_mapping(&self, uuid: &str) -> Result<(), ConsumerError>;
}

/// Configuration for [`AwsRestClient`].
#[derive(Debug, Clone)]
pub struct AwsClientConfig {
    /// AWS region for all three services
    pub region: String,
    /// Optional custom DynamoDB endpoint (for testing)
    pub dynamodb_endpoint: Option<String>,
    /// Optional custom Kinesis endpoint (for testing)
    pub kinesis_endpoint: Option<String>,
    /// Optional custom Lambda endpoint (for testing)
    pub lambda_endpoint: Option<String>,
}

impl Default for AwsClientConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            dynamodb_endpoint: None,
            kinesis_endpoint: None,
            lambda_endpoint: None,
        }
    }
}

impl AwsClientConfig {
    /// Creates a config with the specified region.
    pub fn with_region(region: impl Into<String>) -> Self {
        Self { region: region.into(), ..Self::default() }
    }

    /// Creates a config from AWS SDK config.
    pub fn from_aws_config(config: &aws_config::SdkConfig) -> Self {
        Self {
            region: config
                .region()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "us-east-1".to_string()),
            ..Self::default()
        }
    }
}

/// SigV4-signing REST client implementing all three facade traits.
pub struct AwsRestClient {
    http_client: reqwest::Client,
    credentials_provider: Arc<dyn ProvideCredentials>,
    config: AwsClientConfig,
}

impl AwsRestClient {
    /// Creates a client from the ambient AWS environment.
    pub async fn from_env() -> Result<Self, ConsumerError> {
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest()).load().await;
        Self::from_aws_config(&aws_config)
    }

    /// Creates a client from AWS SDK config.
    pub fn from_aws_config(aws_config: &aws_config::SdkConfig) -> Result<Self, ConsumerError> {
        let credentials_provider = aws_config
            .credentials_provider()
            .ok_or_else(|| ConsumerError::fatal("No AWS credentials provider configured"))?
            .clone();
        Ok(Self {
            http_client: reqwest::Client::new(),
            credentials_provider: Arc::from(credentials_provider),
            config: AwsClientConfig::from_aws_config(aws_config),
        })
    }

    /// Creates a client with explicit credentials and configuration.
    pub fn with_config(
        credentials_provider: Arc<dyn ProvideCredentials>,
        config: AwsClientConfig,
    ) -> Self {
        Self { http_client: reqwest::Client::new(), credentials_provider, config }
    }

    fn dynamodb_endpoint(&self) -> String {
        self.config
            .dynamodb_endpoint
            .clone()
            .unwrap_or_else(|| format!("https://dynamodb.{}.amazonaws.com", self.config.region))
    }

    fn kinesis_endpoint(&self) -> String {
        self.config
            .kinesis_endpoint
            .clone()
            .unwrap_or_else(|| format!("https://kinesis.{}.amazonaws.com", self.config.region))
    }

    fn lambda_endpoint(&self) -> String {
        self.config
            .lambda_endpoint
            .clone()
            .unwrap_or_else(|| format!("https://lambda.{}.amazonaws.com", self.config.region))
    }

    /// Signs an HTTP request with SigV4 and returns the signed headers.
    async fn sign_request(
        &self,
        service: &str,
        method: &str,
        uri: &str,
        body: &[u8],
    ) -> Result<Vec<(String, String)>, ConsumerError> {
        let credentials =
            self.credentials_provider.provide_credentials().await.map_err(|e| {
                ConsumerError::store_retriable(format!("Failed to get AWS credentials: {e}"), None)
            })?;

        let identity = credentials.into();
        let signing_settings = SigningSettings::default();
        let signing_params = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.config.region)
            .name(service)
            .time(SystemTime::now())
            .settings(signing_settings)
            .build()
            .map_err(|e| {
                ConsumerError::store_non_retriable(format!("Failed to build signing params: {e}"), None)
            })?;

        let signable_request = SignableRequest::new(
            method,
            uri,
            std::iter::empty::<(&str, &str)>(),
            SignableBody::Bytes(body),
        )
        .map_err(|e| {
            ConsumerError::store_non_retriable(format!("Failed to create signable request: {e}"), None)
        })?;

        let (signing_instructions, _signature) = sign(signable_request, &signing_params.into())
            .map_err(|e| {
                ConsumerError::store_non_retriable(format!("Failed to sign request: {e}"), None)
            })?
            .into_parts();

        let mut temp_request =
            http::Request::builder().method(method).uri(uri).body(()).map_err(|e| {
                ConsumerError::store_non_retriable(format!("Failed to build temp request: {e}"), None)
            })?;

        signing_instructions.apply_to_request_http1x(&mut temp_request);

        let headers: Vec<(String, String)> = temp_request
            .headers()
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_str().unwrap_or("").to_string()))
            .collect();

        Ok(headers)
    }

    /// Sends one signed JSON-protocol request (DynamoDB / Kinesis style).
    async fn send_target_request(
        &self,
        service: &str,
        endpoint: &str,
        target: &str,
        content_type: &str,
        body: Value,
    ) -> Result<Value, ConsumerError> {
        let body_bytes = serde_json::to_vec(&body)?;
        let uri = format!("{endpoint}/");
        let signed_headers = self.sign_request(service, "POST", &uri, &body_bytes).await?;

        let mut request = self
            .http_client
            .post(&uri)
            .header("Content-Type", content_type)
            .header("X-Amz-Target", target)
            .body(body_bytes);
        for (name, value) in signed_headers {
            request = request.header(&name, &value);
        }

        let response = request.send().await.map_err(|e| {
            ConsumerError::store_retriable(format!("HTTP request to {service} failed: {e}"), None)
        })?;

        let status = response.status();
        let response_body = response.bytes().await.map_err(|e| {
            ConsumerError::store_retriable(format!("Failed to read {service} response body: {e}"), None)
        })?;

        if !status.is_success() {
            return Err(Self::error_from_response(service, status, &response_body));
        }
        if response_body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&response_body).map_err(|e| {
            ConsumerError::serdes(format!("Failed to parse {service} response: {e}"))
        })
    }

    fn error_from_response(
        service: &str,
        status: reqwest::StatusCode,
        body: &[u8],
    ) -> ConsumerError {
        let body_text = String::from_utf8_lossy(body);
        let parsed: Option<Value> = serde_json::from_slice(body).ok();
        let code = parsed
            .as_ref()
            .and_then(|v| v.get("__type"))
            .and_then(|v| v.as_str())
            .map(|t| t.rsplit('#').next().unwrap_or(t).to_string())
            .unwrap_or_else(|| status.to_string());
        let message = parsed
            .as_ref()
            .and_then(|v| v.get("message").or_else(|| v.get("Message")))
            .and_then(|v| v.as_str())
            .map(|m| m.to_string())
            .unwrap_or_else(|| body_text.to_string());

        let is_retriable = status.is_server_error()
            || status.as_u16() == 429
            || is_retriable_store_error_code(&code);
        ConsumerError::Store {
            message: format!("{service} returned {status}: {message}"),
            is_retriable,
            aws_error: Some(AwsError::new(code, message)),
        }
    }

    fn encode_item(item: &BatchStateItem) -> Result<Value, ConsumerError> {
        // The state lists and batch state are stored as canonical JSON
        // documents inside string attributes.
        let mut attributes = json!({
            "streamConsumerId": {"S": item.stream_consumer_id},
            "shardOrEventID": {"S": item.shard_or_event_id},
            "messageStates": {"S": serde_json::to_string(&item.message_states)?},
            "rejectedMessageStates": {"S": serde_json::to_string(&item.rejected_message_states)?},
            "unusableRecordStates": {"S": serde_json::to_string(&item.unusable_record_states)?},
        });
        if let Some(batch_state) = &item.batch_state {
            attributes["batchState"] = json!({"S": serde_json::to_string(batch_state)?});
        }
        Ok(attributes)
    }

    fn string_attribute(item: &Value, name: &str) -> Option<String> {
        item.get(name)?.get("S")?.as_str().map(|s| s.to_string())
    }

    fn decode_item(key: &BatchKey, item: &Value) -> Result<BatchStateItem, ConsumerError> {
        let parse_list = |name: &str| -> Result<Value, ConsumerError> {
            match Self::string_attribute(item, name) {
                Some(text) => Ok(serde_json::from_str(&text)?),
                None => Ok(Value::Array(Vec::new())),
            }
        };
        let batch_state = match Self::string_attribute(item, "batchState") {
            Some(text) => Some(serde_json::from_str(&text)?),
            None => None,
        };
        Ok(BatchStateItem {
            stream_consumer_id: key.stream_consumer_id.clone(),
            shard_or_event_id: key.shard_or_event_id.clone(),
            message_states: serde_json::from_value(parse_list("messageStates")?)?,
            rejected_message_states: serde_json::from_value(parse_list("rejectedMessageStates")?)?,
            unusable_record_states: serde_json::from_value(parse_list("unusableRecordStates")?)?,
            batch_state,
        })
    }
}

#[async_trait]
impl CheckpointStoreClient for AwsRestClient {
    async fn get_batch_state(
        &self,
        table_name: &str,
        key: &BatchKey,
    ) -> Result<Option<BatchStateItem>, ConsumerError> {
        let request = json!({
            "TableName": table_name,
            "Key": {
                "streamConsumerId": {"S": key.stream_consumer_id},
                "shardOrEventID": {"S": key.shard_or_event_id},
            },
            "ConsistentRead": true,
            "ProjectionExpression": "messageStates, rejectedMessageStates, unusableRecordStates, batchState",
        });
        let response = self
            .send_target_request(
                "dynamodb",
                &self.dynamodb_endpoint(),
                "DynamoDB_20120810.GetItem",
                "application/x-amz-json-1.0",
                request,
            )
            .await?;
        match response.get("Item") {
            Some(item) if !item.is_null() => Ok(Some(Self::decode_item(key, item)?)),
            _ => Ok(None),
        }
    }

    async fn put_batch_state(
        &self,
        table_name: &str,
        item: &BatchStateItem,
        expect_existing: bool,
    ) -> Result<(), ConsumerError> {
        let condition = if expect_existing {
            "attribute_exists(streamConsumerId)"
        } else {
            "attribute_not_exists(streamConsumerId)"
        };
        let request = json!({
            "TableName": table_name,
            "Item": Self::encode_item(item)?,
            "ConditionExpression": condition,
        });
        self.send_target_request(
            "dynamodb",
            &self.dynamodb_endpoint(),
            "DynamoDB_20120810.PutItem",
            "application/x-amz-json-1.0",
            request,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DeadLetterStreamClient for AwsRestClient {
    async fn put_record(
        &self,
        stream_name: &str,
        partition_key: &str,
        data: &str,
    ) -> Result<(), ConsumerError> {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine as _;

        let request = json!({
            "StreamName": stream_name,
            "PartitionKey": partition_key,
            "Data": BASE64.encode(data.as_bytes()),
        });
        self.send_target_request(
            "kinesis",
            &self.kinesis_endpoint(),
            "Kinesis_20131202.PutRecord",
            "application/x-amz-json-1.1",
            request,
        )
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ListEventSourceMappingsResponse {
    #[serde(rename = "EventSourceMappings", default)]
    event_source_mappings: Vec<EventSourceMappingSummary>,
}

#[async_trait]
impl EventSourceControlClient for AwsRestClient {
    async fn list_event_source_mappings(
        &self,
        function_name: &str,
    ) -> Result<Vec<EventSourceMappingSummary>, ConsumerError> {
        let uri = format!(
            "{}/2015-03-31/event-source-mappings/?FunctionName={}",
            self.lambda_endpoint(),
            urlencoding::encode(function_name)
        );
        let signed_headers = self.sign_request("lambda", "GET", &uri, &[]).await?;

        let mut request = self.http_client.get(&uri);
        for (name, value) in signed_headers {
            request = request.header(&name, &value);
        }
        let response = request.send().await.map_err(|e| {
            ConsumerError::store_retriable(format!("HTTP request to lambda failed: {e}"), None)
        })?;
        let status = response.status();
        let response_body = response.bytes().await.map_err(|e| {
            ConsumerError::store_retriable(format!("Failed to read lambda response body: {e}"), None)
        })?;
        if !status.is_success() {
            return Err(Self::error_from_response("lambda", status, &response_body));
        }
        let parsed: ListEventSourceMappingsResponse = serde_json::from_slice(&response_body)
            .map_err(|e| ConsumerError::serdes(format!("Failed to parse mapping list: {e}")))?;
        Ok(parsed.event_source_mappings)
    }

    async fn disable_event_source_mapping(&self, uuid: &str) -> Result<(), ConsumerError> {
        let uri = format!(
            "{}/2015-03-31/event-source-mappings/{}",
            self.lambda_endpoint(),
            urlencoding::encode(uuid)
        );
        let body = serde_json::to_vec(&json!({"Enabled": false}))?;
        let signed_headers = self.sign_request("lambda", "PUT", &uri, &body).await?;

        let mut request = self
            .http_client
            .put(&uri)
            .header("Content-Type", "application/json")
            .body(body);
        for (name, value) in signed_headers {
            request = request.header(&name, &value);
        }
        let response = request.send().await.map_err(|e| {
            ConsumerError::store_retriable(format!("HTTP request to lambda failed: {e}"), None)
        })?;
        let status = response.status();
        if !status.is_success() {
            let response_body = response.bytes().await.unwrap_or_default();
            return Err(Self::error_from_response("lambda", status, &response_body));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_store_error_codes() {
        assert!(is_retriable_store_error_code("ProvisionedThroughputExceededException"));
        assert!(is_retriable_store_error_code("ThrottlingException"));
        assert!(is_retriable_store_error_code("ServiceUnavailable"));
        assert!(!is_retriable_store_error_code("ConditionalCheckFailedException"));
        assert!(!is_retriable_store_error_code("ResourceNotFoundException"));
    }

    #[test]
    fn test_error_from_response_parses_dynamodb_type() {
        let body = br#"{"__type":"com.amazonaws.dynamodb.v20120810#ConditionalCheckFailedException","message":"The conditional request failed"}"#;
        let error = AwsRestClient::error_from_response(
            "dynamodb",
            reqwest::StatusCode::BAD_REQUEST,
            body,
        );
        assert!(error.is_conditional_check_failed());
        assert!(!error.is_transient());
    }

    #[test]
    fn test_error_from_response_retriable_throttle() {
        let body = br#"{"__type":"ThrottlingException","message":"Rate exceeded"}"#;
        let error = AwsRestClient::error_from_response(
            "dynamodb",
            reqwest::StatusCode::BAD_REQUEST,
            body,
        );
        assert!(error.is_transient());
    }

    #[test]
    fn test_error_from_response_server_error_is_retriable() {
        let error = AwsRestClient::error_from_response(
            "kinesis",
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            b"oops",
        );
        assert!(error.is_transient());
    }

    #[test]
    fn test_item_encode_decode_round_trip() {
        let item = BatchStateItem {
            stream_consumer_id: "K|S|c".to_string(),
            shard_or_event_id: "S|shard-0".to_string(),
            message_states: vec![Default::default()],
            rejected_message_states: vec![],
            unusable_record_states: vec![],
            batch_state: Some(Default::default()),
        };
        let encoded = AwsRestClient::encode_item(&item).unwrap();
        assert_eq!(encoded["streamConsumerId"]["S"], "K|S|c");

        let key = BatchKey::new("K|S|c", "S|shard-0");
        let decoded = AwsRestClient::decode_item(&key, &encoded).unwrap();
        assert_eq!(decoded, item);
    }

    #[test]
    fn test_mapping_summary_deserialization() {
        let json = r#"{
            "EventSourceMappings": [
                {"UUID": "uuid-1", "State": "Enabled",
                 "EventSourceArn": "arn:aws:kinesis:us-east-1:1:stream/S",
                 "FunctionArn": "arn:aws:lambda:us-east-1:1:function:f"}
            ]
        }"#;
        let parsed: ListEventSourceMappingsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.event_source_mappings.len(), 1);
        assert_eq!(parsed.event_source_mappings[0].uuid, "uuid-1");
    }
}
