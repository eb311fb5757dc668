//! Per-key message sequencing.
//!
//! Given every message's `seqNos` list, this module normalizes the
//! sequence-number parts into comparable form, establishes a total order
//! between messages that share a key chain, and links each chain through
//! `prev`/`next` item indices. The heads of all chains become the batch's
//! `first_messages_to_process`.
//!
//! Stream sequence numbers routinely exceed 128 bits, so integer parts are
//! compared as sign/magnitude digit strings rather than machine integers.

use std::cmp::Ordering;

use serde_json::Value;
use tracing::warn;

use crate::error::ConsumerError;
use crate::identify::NamedValue;

/// The comparison strategy resolved for one sequence-number part name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKind {
    /// All values are integers (of any magnitude)
    Integer,
    /// All values are numeric, at least one with a fractional part
    Decimal,
    /// All values are JSON strings, not all numeric
    String,
    /// Heterogeneous values, compared by canonical text
    Lexicographic,
}

impl std::fmt::Display for SortKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer => write!(f, "Integer"),
            Self::Decimal => write!(f, "Decimal"),
            Self::String => write!(f, "String"),
            Self::Lexicographic => write!(f, "Lexicographic"),
        }
    }
}

/// An arbitrary-magnitude integer key: sign plus digit string without
/// leading zeros.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegerKey {
    negative: bool,
    digits: String,
}

impl IntegerKey {
    /// Parses an integer key from text. Returns None unless the entire
    /// text is an optionally-signed run of ASCII digits.
    pub fn parse(text: &str) -> Option<Self> {
        let (negative, rest) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let stripped = rest.trim_start_matches('0');
        let digits = if stripped.is_empty() { "0" } else { stripped };
        // -0 normalizes to 0
        let negative = negative && digits != "0";
        Some(Self { negative, digits: digits.to_string() })
    }
}

impl Ord for IntegerKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.negative, other.negative) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (negative, _) => {
                let magnitude = self
                    .digits
                    .len()
                    .cmp(&other.digits.len())
                    .then_with(|| self.digits.cmp(&other.digits));
                if negative {
                    magnitude.reverse()
                } else {
                    magnitude
                }
            }
        }
    }
}

impl PartialOrd for IntegerKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A normalized, comparable sequence-number value.
#[derive(Debug, Clone, PartialEq)]
pub enum SortValue {
    /// Arbitrary-magnitude integer
    Integer(IntegerKey),
    /// Floating-point number, compared with total ordering
    Decimal(f64),
    /// Text value
    Text(String),
}

impl SortValue {
    fn compare(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
            (Self::Decimal(a), Self::Decimal(b)) => a.total_cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            // Kinds are resolved once per part name and values are
            // normalized under that kind before comparison, so two values
            // compared under equal names always share a variant. Never
            // coerce across kinds: a mismatch here is a broken invariant.
            _ => unreachable!(
                "sequence parts compared with disagreeing sort kinds ({self:?} vs {other:?}); \
                 values must be normalized per part name before comparison"
            ),
        }
    }
}

/// One normalized sequence-number part of a message.
#[derive(Debug, Clone, PartialEq)]
pub struct SortablePart {
    /// The part name
    pub name: String,
    /// The comparison strategy for this part name
    pub kind: SortKind,
    /// The normalized comparable value
    pub value: SortValue,
    /// The original value, retained for serialization
    pub original: Value,
}

/// A message's sequencing input: its index in the batch, its joined key
/// and its raw `seqNos` parts.
#[derive(Debug, Clone)]
pub struct SequencingInput {
    /// Index of the message item in the batch
    pub index: usize,
    /// Joined key projection; messages with equal keys share a chain
    pub key: String,
    /// The raw sequence-number parts
    pub seq_nos: Vec<NamedValue>,
}

/// A message's sequencing result: normalized parts and chain links.
#[derive(Debug, Clone)]
pub struct SequencedMessage {
    /// Index of the message item in the batch
    pub index: usize,
    /// Normalized sequence-number parts
    pub parts: Vec<SortablePart>,
    /// Index of the previous message in this chain
    pub prev: Option<usize>,
    /// Index of the next message in this chain
    pub next: Option<usize>,
}

/// The output of sequencing a batch of messages.
#[derive(Debug, Clone, Default)]
pub struct SequencingOutcome {
    /// Per-message normalized parts and links, in input order
    pub messages: Vec<SequencedMessage>,
    /// Heads of all processing chains
    pub first_messages_to_process: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueClass {
    IntegerLike,
    NumericLike,
    StringLike,
    Other,
}

fn classify(value: &Value) -> ValueClass {
    match value {
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                ValueClass::IntegerLike
            } else {
                ValueClass::NumericLike
            }
        }
        Value::String(s) => {
            if IntegerKey::parse(s).is_some() {
                ValueClass::IntegerLike
            } else if s.parse::<f64>().is_ok() {
                ValueClass::NumericLike
            } else {
                ValueClass::StringLike
            }
        }
        _ => ValueClass::Other,
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolves the sort kind for one part name by scanning all of its values
/// across the batch.
pub fn resolve_sort_kind(values: &[&Value]) -> SortKind {
    let classes: Vec<ValueClass> = values.iter().map(|v| classify(v)).collect();
    if classes.iter().all(|c| *c == ValueClass::IntegerLike) {
        SortKind::Integer
    } else if classes
        .iter()
        .all(|c| matches!(c, ValueClass::IntegerLike | ValueClass::NumericLike))
    {
        SortKind::Decimal
    } else if values.iter().all(|v| v.is_string()) {
        SortKind::String
    } else {
        SortKind::Lexicographic
    }
}

fn normalize_value(kind: SortKind, value: &Value) -> Result<SortValue, ConsumerError> {
    let text = value_text(value);
    match kind {
        SortKind::Integer => IntegerKey::parse(&text).map(SortValue::Integer).ok_or_else(|| {
            ConsumerError::validation(format!("Value '{text}' is not an integer sequence part"))
        }),
        SortKind::Decimal => text.parse::<f64>().map(SortValue::Decimal).map_err(|_| {
            ConsumerError::validation(format!("Value '{text}' is not a numeric sequence part"))
        }),
        SortKind::String | SortKind::Lexicographic => Ok(SortValue::Text(text)),
    }
}

/// Compares two messages that share the same key chain.
///
/// Part-key names are compared ordinal by ordinal; a name mismatch breaks
/// the tie by name; equal names compare by normalized value. A message with
/// fewer parts sorts after a message with more parts.
///
/// # Panics
///
/// Panics if two parts with equal names carry values of disagreeing sort
/// kinds. [`sequence_messages`] normalizes every value under its part
/// name's resolved kind, so this only fires on parts built outside that
/// path.
pub fn compare_sequenced(a: &[SortablePart], b: &[SortablePart]) -> Ordering {
    for (pa, pb) in a.iter().zip(b.iter()) {
        let by_name = pa.name.cmp(&pb.name);
        if by_name != Ordering::Equal {
            return by_name;
        }
        let by_value = pa.value.compare(&pb.value);
        if by_value != Ordering::Equal {
            return by_value;
        }
    }
    // Fewer parts sorts after more parts.
    b.len().cmp(&a.len())
}

/// Normalizes sequence-number parts and links the per-key (or global)
/// processing chains.
///
/// Sort kinds are resolved once per part name across the whole batch, so a
/// kind conflict between two part names sharing an ordinal position is
/// detected here rather than at compare time. When `strict` is set,
/// multiple distinct part names at one ordinal also fail hard; otherwise
/// they are logged and the name ordering breaks ties.
pub fn sequence_messages(
    inputs: Vec<SequencingInput>,
    per_key: bool,
    strict: bool,
) -> Result<SequencingOutcome, ConsumerError> {
    if inputs.is_empty() {
        return Ok(SequencingOutcome::default());
    }
    if inputs.len() == 1 {
        // A single message needs no sequencing work.
        let input = inputs.into_iter().next().ok_or_else(|| {
            ConsumerError::validation("Sequencing input disappeared")
        })?;
        return Ok(SequencingOutcome {
            first_messages_to_process: vec![input.index],
            messages: vec![SequencedMessage {
                index: input.index,
                parts: Vec::new(),
                prev: None,
                next: None,
            }],
        });
    }

    // Resolve one sort kind per distinct part name.
    let mut names_in_order: Vec<String> = Vec::new();
    let mut values_by_name: std::collections::HashMap<String, Vec<&Value>> =
        std::collections::HashMap::new();
    let max_parts = inputs.iter().map(|i| i.seq_nos.len()).max().unwrap_or(0);
    for input in &inputs {
        for part in &input.seq_nos {
            let entry = values_by_name.entry(part.name.clone()).or_insert_with(|| {
                names_in_order.push(part.name.clone());
                Vec::new()
            });
            entry.push(&part.value);
        }
    }
    let mut kinds: std::collections::HashMap<String, SortKind> = std::collections::HashMap::new();
    for name in &names_in_order {
        if let Some(values) = values_by_name.get(name) {
            kinds.insert(name.clone(), resolve_sort_kind(values));
        }
    }

    // Inspect each ordinal position for mixed part names.
    for ordinal in 0..max_parts {
        let mut names_at_ordinal: Vec<&str> = inputs
            .iter()
            .filter_map(|i| i.seq_nos.get(ordinal))
            .map(|p| p.name.as_str())
            .collect();
        names_at_ordinal.sort_unstable();
        names_at_ordinal.dedup();
        if names_at_ordinal.len() > 1 {
            if strict {
                return Err(ConsumerError::validation(format!(
                    "Strict sequencing requires a single part name at ordinal {ordinal}, found: {}",
                    names_at_ordinal.join(", ")
                )));
            }
            warn!(ordinal, names = ?names_at_ordinal, "Multiple sequence part names at one ordinal position");
            let distinct_kinds: std::collections::HashSet<_> = names_at_ordinal
                .iter()
                .filter_map(|n| kinds.get(*n))
                .map(|k| format!("{k}"))
                .collect();
            if distinct_kinds.len() > 1 {
                return Err(ConsumerError::validation(format!(
                    "Sequence parts at ordinal {ordinal} resolve to conflicting sort kinds: {}",
                    names_at_ordinal.join(", ")
                )));
            }
        }
    }

    // Normalize each message's parts.
    let mut messages: Vec<SequencedMessage> = Vec::with_capacity(inputs.len());
    for input in &inputs {
        let mut parts = Vec::with_capacity(input.seq_nos.len());
        for part in &input.seq_nos {
            let kind = kinds.get(&part.name).copied().unwrap_or(SortKind::Lexicographic);
            parts.push(SortablePart {
                name: part.name.clone(),
                kind,
                value: normalize_value(kind, &part.value)?,
                original: part.value.clone(),
            });
        }
        messages.push(SequencedMessage { index: input.index, parts, prev: None, next: None });
    }

    // Group into chains, preserving first-appearance order of keys.
    let mut group_keys: Vec<&str> = Vec::new();
    let mut groups: std::collections::HashMap<&str, Vec<usize>> = std::collections::HashMap::new();
    for (pos, input) in inputs.iter().enumerate() {
        let group_key = if per_key { input.key.as_str() } else { "" };
        let entry = groups.entry(group_key).or_insert_with(|| {
            group_keys.push(group_key);
            Vec::new()
        });
        entry.push(pos);
    }

    let mut heads = Vec::with_capacity(group_keys.len());
    for group_key in group_keys {
        let Some(mut positions) = groups.remove(group_key) else { continue };
        positions
            .sort_by(|&a, &b| compare_sequenced(&messages[a].parts, &messages[b].parts));

        let item_indices: Vec<usize> = positions.iter().map(|&p| messages[p].index).collect();
        for (window, &position) in positions.iter().enumerate() {
            messages[position].prev =
                window.checked_sub(1).map(|w| item_indices[w]);
            messages[position].next = item_indices.get(window + 1).copied();
        }
        if let Some(&head) = item_indices.first() {
            heads.push(head);
        }
    }

    Ok(SequencingOutcome { messages, first_messages_to_process: heads })
}
