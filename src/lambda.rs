//! Host runtime surface for the stream consumer core.
//!
//! This module defines the inbound stream event and record types delivered
//! by the host function runtime, and the [`InvocationContext`] trait through
//! which the core reads the function identity and the remaining wall-clock
//! time of the current invocation.
//!
//! Records are kept opaque: the core only needs the event triple
//! (`eventID`, sequence number, optional sub-sequence number) and the event
//! source ARN. Decoding records into messages is the caller's concern.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value;

use crate::error::ConsumerError;

/// The inbound batch of stream records for one invocation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamEvent {
    /// The records delivered from a single shard-equivalent
    #[serde(rename = "Records", default)]
    pub records: Vec<Record>,
}

impl StreamEvent {
    /// Creates a StreamEvent from a list of records.
    pub fn with_records(records: Vec<Record>) -> Self {
        Self { records }
    }
}

/// An opaque stream record.
///
/// Wraps the raw JSON delivered by the host and exposes accessors for the
/// fields the core needs. Both Kinesis and DynamoDB Streams record shapes
/// are understood.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct Record(pub Value);

impl Record {
    /// Creates a Record from a raw JSON value.
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Returns the raw JSON value of this record.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    fn str_at(&self, path: &[&str]) -> Option<&str> {
        let mut current = &self.0;
        for part in path {
            current = current.get(part)?;
        }
        current.as_str()
    }

    /// Returns the record's event identifier.
    pub fn event_id(&self) -> Option<&str> {
        self.str_at(&["eventID"])
    }

    /// Returns the record's event source (e.g. `aws:kinesis`).
    pub fn event_source(&self) -> Option<&str> {
        self.str_at(&["eventSource"])
    }

    /// Returns the record's event source ARN.
    pub fn event_source_arn(&self) -> Option<&str> {
        self.str_at(&["eventSourceARN"])
    }

    /// Returns the record's event sequence number.
    ///
    /// Kinesis records carry it at `kinesis.sequenceNumber`, DynamoDB
    /// Streams records at `dynamodb.SequenceNumber`.
    pub fn event_seq_no(&self) -> Option<&str> {
        self.str_at(&["kinesis", "sequenceNumber"])
            .or_else(|| self.str_at(&["dynamodb", "SequenceNumber"]))
            .or_else(|| self.str_at(&["eventSeqNo"]))
    }

    /// Returns the Kinesis partition key, if present.
    pub fn partition_key(&self) -> Option<&str> {
        self.str_at(&["kinesis", "partitionKey"])
    }

    /// Returns the base64-encoded Kinesis data payload, if present.
    pub fn data(&self) -> Option<&str> {
        self.str_at(&["kinesis", "data"])
    }

    /// Decodes the Kinesis data payload from base64.
    pub fn decoded_data(&self) -> Result<Option<Vec<u8>>, ConsumerError> {
        match self.data() {
            Some(data) => BASE64
                .decode(data)
                .map(Some)
                .map_err(|e| ConsumerError::unusable(format!("Invalid base64 record data: {e}"))),
            None => Ok(None),
        }
    }

    /// Derives the shard id of a Kinesis record from its event identifier
    /// (`shardId-000000000000:<sequenceNumber>`).
    pub fn shard_id(&self) -> Option<&str> {
        let event_id = self.event_id()?;
        let shard = event_id.split(':').next()?;
        if shard.starts_with("shardId-") {
            Some(shard)
        } else {
            None
        }
    }

    /// Extracts the stream or table name from the event source ARN.
    ///
    /// Kinesis: `arn:aws:kinesis:region:account:stream/<name>`.
    /// DynamoDB: `arn:aws:dynamodb:region:account:table/<name>/stream/<ts>`.
    pub fn source_stream_name(&self) -> Option<&str> {
        let arn = self.event_source_arn()?;
        let resource = arn.splitn(6, ':').nth(5)?;
        let mut parts = resource.split('/');
        match parts.next()? {
            "stream" | "table" => parts.next(),
            _ => None,
        }
    }

    /// Extracts the stream timestamp from a DynamoDB Streams event source
    /// ARN (`.../table/<name>/stream/<timestamp>`).
    pub fn source_stream_timestamp(&self) -> Option<&str> {
        let arn = self.event_source_arn()?;
        let resource = arn.splitn(6, ':').nth(5)?;
        let mut parts = resource.split('/');
        if parts.next()? != "table" {
            return None;
        }
        parts.next()?;
        if parts.next()? != "stream" {
            return None;
        }
        parts.next()
    }
}

/// The host runtime surface consumed by the core.
///
/// Implemented over the host's invocation context; supplies the function
/// identity used for consumer-id derivation and the remaining time used to
/// compute phase deadlines.
pub trait InvocationContext: Send + Sync {
    /// The name of the executing function.
    fn function_name(&self) -> &str;

    /// The alias or version the function was invoked through.
    fn function_version(&self) -> &str;

    /// The full ARN the function was invoked with.
    fn invoked_function_arn(&self) -> &str;

    /// Milliseconds of wall-clock time remaining before the host kills
    /// this invocation.
    fn remaining_time_millis(&self) -> u64;
}

/// An [`InvocationContext`] backed by a fixed identity and a deadline
/// captured at construction time. Useful for tests and local harnesses.
#[derive(Debug, Clone)]
pub struct FixedInvocationContext {
    function_name: String,
    function_version: String,
    invoked_function_arn: String,
    deadline: std::time::Instant,
}

impl FixedInvocationContext {
    /// Creates a context that reports `time_budget` remaining from now.
    pub fn new(
        function_name: impl Into<String>,
        function_version: impl Into<String>,
        time_budget: std::time::Duration,
    ) -> Self {
        let function_name = function_name.into();
        let invoked_function_arn =
            format!("arn:aws:lambda:us-east-1:111111111111:function:{function_name}");
        Self {
            function_name,
            function_version: function_version.into(),
            invoked_function_arn,
            deadline: std::time::Instant::now() + time_budget,
        }
    }
}

impl InvocationContext for FixedInvocationContext {
    fn function_name(&self) -> &str {
        &self.function_name
    }

    fn function_version(&self) -> &str {
        &self.function_version
    }

    fn invoked_function_arn(&self) -> &str {
        &self.invoked_function_arn
    }

    fn remaining_time_millis(&self) -> u64 {
        self.deadline
            .saturating_duration_since(std::time::Instant::now())
            .as_millis() as u64
    }
}
