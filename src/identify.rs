//! Message identification: content digests, event coordinates and message
//! identity resolution.
//!
//! Every message extracted from a record is given a stable fingerprint built
//! from three ordered name-value lists (`ids`, `keys`, `seqNos`), the
//! record's event coordinates, and MD5 digests of the JSON-encoded message,
//! record, user record and raw data payload. The checkpoint codec matches
//! prior state onto fresh batches through these fingerprints.

use md5::{Digest as _, Md5};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ConsumerConfig;
use crate::error::ConsumerError;
use crate::lambda::Record;

/// Delimiter between a part name and its value in joined projections.
const NAME_VALUE_DELIMITER: char = ':';
/// Delimiter between parts in joined projections.
const PART_DELIMITER: char = '|';

/// MD5 content digests of a tracked item's constituents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digests {
    /// Digest of the JSON-encoded message
    #[serde(rename = "msg", skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    /// Digest of the JSON-encoded record
    #[serde(rename = "rec", skip_serializing_if = "Option::is_none")]
    pub rec: Option<String>,
    /// Digest of the JSON-encoded user record
    #[serde(rename = "userRec", skip_serializing_if = "Option::is_none")]
    pub user_rec: Option<String>,
    /// Digest of the raw data payload, when the record exposes one
    #[serde(rename = "data", skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Digests {
    /// Returns true if no digest could be derived.
    pub fn is_empty(&self) -> bool {
        self.msg.is_none() && self.rec.is_none() && self.user_rec.is_none() && self.data.is_none()
    }
}

/// The event triple extracted from a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCoordinates {
    /// The record's event identifier
    #[serde(rename = "eventID")]
    pub event_id: String,
    /// The record's event sequence number
    #[serde(rename = "eventSeqNo")]
    pub event_seq_no: String,
    /// The sub-sequence number for de-aggregated user records
    #[serde(rename = "eventSubSeqNo", skip_serializing_if = "Option::is_none")]
    pub event_sub_seq_no: Option<String>,
}

impl EventCoordinates {
    /// Returns true if neither an event id nor a sequence number is known.
    pub fn is_empty(&self) -> bool {
        self.event_id.is_empty() && self.event_seq_no.is_empty()
    }
}

/// An ordered name-value pair within an identity list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedValue {
    /// The property name
    #[serde(rename = "name")]
    pub name: String,
    /// The property value
    #[serde(rename = "value")]
    pub value: Value,
}

impl NamedValue {
    /// Creates a new NamedValue.
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self { name: name.into(), value }
    }

    fn value_text(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// The resolved identity of a message: the three ordered name-value lists
/// plus their cached joined projections.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageIdentity {
    /// Uniquely identifying properties
    pub ids: Vec<NamedValue>,
    /// Sequencing-group properties (messages with equal keys form a chain)
    pub keys: Vec<NamedValue>,
    /// Sequencing-order properties
    pub seq_nos: Vec<NamedValue>,
    /// Joined projection of `ids`
    pub id: String,
    /// Joined projection of `keys`
    pub key: String,
    /// Joined projection of `seq_nos`
    pub seq_no: String,
}

impl MessageIdentity {
    /// Returns true if the identity carries no identifying parts at all.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.keys.is_empty() && self.seq_nos.is_empty()
    }

    /// A short description of this message for log lines.
    pub fn describe(&self) -> String {
        if !self.id.is_empty() {
            format!("message ({})", self.id)
        } else if !self.key.is_empty() {
            format!("message ({}; {})", self.key, self.seq_no)
        } else if !self.seq_no.is_empty() {
            format!("message ({})", self.seq_no)
        } else {
            "message".to_string()
        }
    }
}

/// Joins a list of name-value pairs into a stable string projection.
pub fn join_parts(parts: &[NamedValue]) -> String {
    parts
        .iter()
        .map(|p| format!("{}{}{}", p.name, NAME_VALUE_DELIMITER, p.value_text()))
        .collect::<Vec<_>>()
        .join(&PART_DELIMITER.to_string())
}

fn md5_hex(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn md5_of_value(value: &Value) -> Result<String, ConsumerError> {
    let encoded = serde_json::to_vec(value)?;
    Ok(md5_hex(&encoded))
}

/// Derives stable MD5 content digests for a message / record / user record
/// combination.
///
/// The `data` digest is derived from the record's decoded raw payload when
/// it exposes one; a payload that fails to decode simply gets no data
/// digest (the record digest still fingerprints it).
pub fn derive_digests(
    message: Option<&Value>,
    record: &Record,
    user_record: Option<&Value>,
) -> Result<Digests, ConsumerError> {
    let data = record.decoded_data().ok().flatten().map(|bytes| md5_hex(&bytes));
    Ok(Digests {
        msg: message.map(md5_of_value).transpose()?,
        rec: Some(md5_of_value(record.as_value())?),
        user_rec: user_record.map(md5_of_value).transpose()?,
        data,
    })
}

/// Extracts the event triple from a record (and its user record when the
/// record is an aggregate carrying de-aggregated sub-records).
pub fn resolve_event_coordinates(
    record: &Record,
    user_record: Option<&Value>,
) -> Result<EventCoordinates, ConsumerError> {
    let event_id = record
        .event_id()
        .ok_or_else(|| ConsumerError::unusable("Record has no eventID"))?
        .to_string();
    let event_seq_no = record
        .event_seq_no()
        .ok_or_else(|| ConsumerError::unusable("Record has no event sequence number"))?
        .to_string();
    let event_sub_seq_no = user_record
        .and_then(|ur| ur.get("subSequenceNumber"))
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    Ok(EventCoordinates { event_id, event_seq_no, event_sub_seq_no })
}

fn lookup_property(message: &Value, name: &str) -> Option<Value> {
    // Dotted names address nested properties.
    let mut current = message;
    for part in name.split('.') {
        current = current.get(part)?;
    }
    Some(current.clone())
}

fn collect_parts(
    message: &Value,
    names: &[String],
    list_name: &str,
) -> Result<Vec<NamedValue>, ConsumerError> {
    let mut parts = Vec::with_capacity(names.len());
    for name in names {
        match lookup_property(message, name) {
            Some(value) if !value.is_null() => parts.push(NamedValue::new(name.clone(), value)),
            _ => {
                return Err(ConsumerError::rejection(format!(
                    "Message is missing {list_name} property '{name}'"
                )));
            }
        }
    }
    Ok(parts)
}

/// Resolves the full identity of a message.
///
/// The configured property-name lists select values out of the message. The
/// fallback policy when a list is not configured:
/// - `seqNos` defaults to `[("eventSeqNo", record's event sequence number)]`
///   (with the sub-sequence number appended for de-aggregated records);
/// - `keys` may be empty, in which case all messages sequence together;
/// - `ids` defaults to the concatenation `keys ++ seqNos`.
///
/// A configured property missing from the message rejects the message.
pub fn resolve_message_identity(
    message: &Value,
    coords: &EventCoordinates,
    config: &ConsumerConfig,
) -> Result<MessageIdentity, ConsumerError> {
    let keys = collect_parts(message, &config.key_property_names, "key")?;

    let seq_nos = if config.seq_no_property_names.is_empty() {
        let mut parts =
            vec![NamedValue::new("eventSeqNo", Value::String(coords.event_seq_no.clone()))];
        if let Some(sub) = &coords.event_sub_seq_no {
            parts.push(NamedValue::new("eventSubSeqNo", Value::String(sub.clone())));
        }
        parts
    } else {
        collect_parts(message, &config.seq_no_property_names, "sequence number")?
    };

    let ids = if config.id_property_names.is_empty() {
        keys.iter().chain(seq_nos.iter()).cloned().collect()
    } else {
        collect_parts(message, &config.id_property_names, "id")?
    };

    let id = join_parts(&ids);
    let key = join_parts(&keys);
    let seq_no = join_parts(&seq_nos);

    Ok(MessageIdentity { ids, keys, seq_nos, id, key, seq_no })
}
