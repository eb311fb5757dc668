//! The checkpoint codec.
//!
//! Projects a live batch onto its stored item, persists it with
//! conditional writes (insert first, update on conflict, one-shot fallback
//! between the modes), and on load overlays a prior item's task snapshots
//! onto the current batch's items by identifier or content match.
//!
//! Matching uses the "big fat key" (BFK): a stable concatenation of every
//! available identifier of a state (event coordinates, joined id/key/seqNo
//! projections and all content digests). States lacking any identifier are
//! instead matched by deep equality on the original message, user record
//! or record that was attached at save time.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, trace};

use crate::batch::state::{
    BatchKey, BatchStateItem, MessageItem, StoredBatchState, StoredMessageState,
    StoredUnusableRecordState, UnusableItem,
};
use crate::batch::Batch;
use crate::client::CheckpointStoreClient;
use crate::error::ConsumerError;
use crate::identify::{join_parts, Digests};
use crate::task::Task;

fn snapshot_map(
    tasks: &std::collections::BTreeMap<String, Task>,
) -> std::collections::BTreeMap<String, crate::task::TaskSnapshot> {
    tasks.iter().map(|(name, task)| (name.clone(), task.to_snapshot())).collect()
}

/// Builds the BFK of a state from its identifier components. Returns
/// `None` when no identifier is available at all.
fn build_bfk(
    event_id: &str,
    event_seq_no: &str,
    event_sub_seq_no: Option<&str>,
    id: &str,
    key: &str,
    seq_no: &str,
    digests: &Digests,
) -> Option<String> {
    let parts = [
        event_id,
        event_seq_no,
        event_sub_seq_no.unwrap_or(""),
        id,
        key,
        seq_no,
        digests.msg.as_deref().unwrap_or(""),
        digests.rec.as_deref().unwrap_or(""),
        digests.user_rec.as_deref().unwrap_or(""),
        digests.data.as_deref().unwrap_or(""),
    ];
    if parts.iter().all(|p| p.is_empty()) {
        return None;
    }
    Some(parts.join("#"))
}

fn message_item_bfk(item: &MessageItem) -> Option<String> {
    build_bfk(
        &item.coords.event_id,
        &item.coords.event_seq_no,
        item.coords.event_sub_seq_no.as_deref(),
        &item.identity.id,
        &item.identity.key,
        &item.identity.seq_no,
        &item.digests,
    )
}

fn stored_message_bfk(state: &StoredMessageState) -> Option<String> {
    build_bfk(
        &state.event_id,
        &state.event_seq_no,
        state.event_sub_seq_no.as_deref(),
        &join_parts(&state.ids),
        &join_parts(&state.keys),
        &join_parts(&state.seq_nos),
        &state.md5s,
    )
}

fn unusable_item_bfk(item: &UnusableItem) -> Option<String> {
    let coords = item.coords.as_ref();
    build_bfk(
        coords.map(|c| c.event_id.as_str()).unwrap_or(""),
        coords.map(|c| c.event_seq_no.as_str()).unwrap_or(""),
        coords.and_then(|c| c.event_sub_seq_no.as_deref()),
        "",
        "",
        "",
        &item.digests,
    )
}

fn stored_unusable_bfk(state: &StoredUnusableRecordState) -> Option<String> {
    build_bfk(
        &state.event_id,
        &state.event_seq_no,
        state.event_sub_seq_no.as_deref(),
        "",
        "",
        "",
        &state.md5s,
    )
}

fn stored_message_state(batch: &Batch, item: &MessageItem) -> StoredMessageState {
    let mut stored = StoredMessageState {
        ids: item.identity.ids.clone(),
        keys: item.identity.keys.clone(),
        seq_nos: item.identity.seq_nos.clone(),
        md5s: item.digests.clone(),
        event_id: item.coords.event_id.clone(),
        event_seq_no: item.coords.event_seq_no.clone(),
        event_sub_seq_no: item.coords.event_sub_seq_no.clone(),
        ones: snapshot_map(&item.ones),
        alls: snapshot_map(&item.alls),
        discards: snapshot_map(&item.discards),
        reason_rejected: item.reason_rejected.clone(),
        message: None,
        user_record: None,
        record: None,
    };
    if stored_message_bfk(&stored).is_none() {
        // No usable identifier: attach copies for content-based matching.
        stored.message = Some(item.message.clone());
        stored.user_record = item.user_record.clone();
        stored.record = item
            .record_index
            .and_then(|i| batch.records().get(i))
            .map(|r| r.as_value().clone());
    }
    stored
}

fn stored_unusable_state(batch: &Batch, item: &UnusableItem) -> StoredUnusableRecordState {
    let mut stored = StoredUnusableRecordState {
        event_id: item.coords.as_ref().map(|c| c.event_id.clone()).unwrap_or_default(),
        event_seq_no: item.coords.as_ref().map(|c| c.event_seq_no.clone()).unwrap_or_default(),
        event_sub_seq_no: item.coords.as_ref().and_then(|c| c.event_sub_seq_no.clone()),
        md5s: item.digests.clone(),
        reason_unusable: item.reason_unusable.clone(),
        discards: snapshot_map(&item.discards),
        record: None,
        user_record: None,
    };
    if stored_unusable_bfk(&stored).is_none() {
        stored.record = item
            .record_index
            .and_then(|i| batch.records().get(i))
            .map(|r| r.as_value().clone());
        stored.user_record = item.user_record.clone();
    }
    stored
}

/// Projects the batch's live state onto the stored checkpoint item.
pub fn serialize_batch(batch: &Batch) -> BatchStateItem {
    let message_states = batch
        .messages()
        .iter()
        .filter_map(|&i| batch.item(i))
        .map(|item| stored_message_state(batch, item))
        .collect();
    let rejected_message_states = batch
        .rejected_messages()
        .iter()
        .filter_map(|&i| batch.item(i))
        .map(|item| stored_message_state(batch, item))
        .collect();
    let unusable_record_states = batch
        .unusable_records()
        .iter()
        .map(|item| stored_unusable_state(batch, item))
        .collect();
    let state = batch.state();
    BatchStateItem {
        stream_consumer_id: batch.key().stream_consumer_id.clone(),
        shard_or_event_id: batch.key().shard_or_event_id.clone(),
        message_states,
        rejected_message_states,
        unusable_record_states,
        batch_state: Some(StoredBatchState {
            alls: snapshot_map(&state.alls),
            initiating: snapshot_map(&state.initiating),
            processing: snapshot_map(&state.processing),
            finalising: snapshot_map(&state.finalising),
        }),
    }
}

/// An index over prior states: BFK-keyed plus a content-matched remainder.
struct PriorIndex<S> {
    by_bfk: HashMap<String, S>,
    by_content: Vec<S>,
}

impl<S> PriorIndex<S> {
    fn build(states: Vec<S>, bfk: impl Fn(&S) -> Option<String>) -> Self {
        let mut by_bfk = HashMap::new();
        let mut by_content = Vec::new();
        for state in states {
            match bfk(&state) {
                Some(key) => {
                    by_bfk.insert(key, state);
                }
                None => by_content.push(state),
            }
        }
        Self { by_bfk, by_content }
    }

    fn take_by_bfk(&mut self, bfk: Option<&str>) -> Option<S> {
        bfk.and_then(|key| self.by_bfk.remove(key))
    }

    fn take_by_content(&mut self, matches: impl Fn(&S) -> bool) -> Option<S> {
        let position = self.by_content.iter().position(|s| matches(s))?;
        Some(self.by_content.remove(position))
    }
}

fn content_values_equal(a: Option<&Value>, b: Option<&Value>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a == b)
}

fn message_content_matches(state: &StoredMessageState, item: &MessageItem) -> bool {
    content_values_equal(state.message.as_ref(), Some(&item.message))
        || content_values_equal(state.user_record.as_ref(), item.user_record.as_ref())
}

/// Overlays a prior checkpoint item's task snapshots onto the current
/// batch's items.
///
/// Matching order per current message: the prior message states first,
/// then the prior rejected-message states (a hit there moves the message
/// to `rejected_messages`). Current rejected messages probe the rejected
/// states first. Unusable records match by BFK, then by record content.
/// The matched state is installed as the item's `prior`, feeding the
/// subsequent task revival; unmatched items proceed with fresh task trees.
pub fn restore_batch(batch: &mut Batch, prior_item: BatchStateItem) {
    let mut prior_messages =
        PriorIndex::build(prior_item.message_states, stored_message_bfk);
    let mut prior_rejected =
        PriorIndex::build(prior_item.rejected_message_states, stored_message_bfk);
    let mut prior_unusable =
        PriorIndex::build(prior_item.unusable_record_states, stored_unusable_bfk);

    let mut to_reject: Vec<(usize, Option<String>)> = Vec::new();

    for &index in &batch.messages().to_vec() {
        let Some(item) = batch.item(index) else { continue };
        let bfk = message_item_bfk(item);
        let matched = prior_messages
            .take_by_bfk(bfk.as_deref())
            .or_else(|| prior_messages.take_by_content(|s| message_content_matches(s, item)));
        if let Some(prior) = matched {
            if let Some(item) = batch.item_mut(index) {
                item.prior = Some(prior);
            }
            continue;
        }
        let rejected = prior_rejected
            .take_by_bfk(bfk.as_deref())
            .or_else(|| prior_rejected.take_by_content(|s| message_content_matches(s, item)));
        match rejected {
            Some(prior) => {
                let reason = prior.reason_rejected.clone();
                if let Some(item) = batch.item_mut(index) {
                    item.prior = Some(prior);
                }
                to_reject.push((index, reason));
            }
            None => {
                trace!(index, "No prior state matched this message; starting fresh");
            }
        }
    }

    for (index, reason) in to_reject {
        debug!(index, "Prior state shows this message was rejected");
        batch.move_message_to_rejected(index, reason);
    }

    for &index in &batch.rejected_messages().to_vec() {
        let Some(item) = batch.item(index) else { continue };
        if item.prior.is_some() {
            continue;
        }
        let bfk = message_item_bfk(item);
        let matched = prior_rejected
            .take_by_bfk(bfk.as_deref())
            .or_else(|| prior_rejected.take_by_content(|s| message_content_matches(s, item)))
            .or_else(|| prior_messages.take_by_bfk(bfk.as_deref()))
            .or_else(|| prior_messages.take_by_content(|s| message_content_matches(s, item)));
        match matched {
            Some(prior) => {
                if let Some(item) = batch.item_mut(index) {
                    item.prior = Some(prior);
                }
            }
            None => trace!(index, "No prior state matched this rejected message"),
        }
    }

    let record_values: Vec<Option<Value>> = batch
        .unusable_records()
        .iter()
        .map(|item| {
            item.record_index
                .and_then(|i| batch.records().get(i))
                .map(|r| r.as_value().clone())
        })
        .collect();
    for (index, item) in batch.unusable_records_mut().iter_mut().enumerate() {
        let bfk = unusable_item_bfk(item);
        let record_value = record_values.get(index).cloned().flatten();
        let matched = prior_unusable.take_by_bfk(bfk.as_deref()).or_else(|| {
            prior_unusable.take_by_content(|s| {
                content_values_equal(s.record.as_ref(), record_value.as_ref())
                    || content_values_equal(s.user_record.as_ref(), item.user_record.as_ref())
            })
        });
        match matched {
            Some(prior) => item.prior = Some(prior),
            None => trace!(index, "No prior state matched this unusable record"),
        }
    }

    batch.state_mut().prior = prior_item.batch_state;
}

/// Persists and loads checkpoint items through the store facade, applying
/// the insert-vs-update protocol and the error classification policy.
pub struct CheckpointCodec {
    store: Arc<dyn CheckpointStoreClient>,
    table_name: String,
}

impl CheckpointCodec {
    /// Creates a codec over the given store and (stage-qualified) table.
    pub fn new(store: Arc<dyn CheckpointStoreClient>, table_name: impl Into<String>) -> Self {
        Self { store, table_name: table_name.into() }
    }

    fn classify(error: ConsumerError) -> ConsumerError {
        match &error {
            ConsumerError::Store { message, is_retriable, aws_error } => {
                if aws_error
                    .as_ref()
                    .map(|e| e.code.contains("ResourceNotFound"))
                    .unwrap_or(false)
                {
                    ConsumerError::fatal(format!("Checkpoint table is missing: {message}"))
                } else if *is_retriable {
                    ConsumerError::Transient {
                        message: message.clone(),
                        aws_error: aws_error.clone(),
                    }
                } else {
                    error
                }
            }
            _ => error,
        }
    }

    /// Loads the prior batch state. A missing item means no prior state.
    pub async fn load(&self, key: &BatchKey) -> Result<Option<BatchStateItem>, ConsumerError> {
        self.store
            .get_batch_state(&self.table_name, key)
            .await
            .map_err(Self::classify)
    }

    /// Saves the batch state.
    ///
    /// `previously_saved == Some(true)` tries a conditional update first;
    /// anything else tries a conditional insert first. On a
    /// conditional-check failure the mode is flipped and retried once.
    /// Resolves with the new `previously_saved` value (`true`).
    pub async fn save(
        &self,
        item: BatchStateItem,
        previously_saved: Option<bool>,
    ) -> Result<bool, ConsumerError> {
        if !item.key().is_valid() {
            return Err(ConsumerError::validation(format!(
                "Refusing to save batch state with an invalid key {}",
                item.key()
            )));
        }
        let expect_existing = previously_saved == Some(true);
        match self.store.put_batch_state(&self.table_name, &item, expect_existing).await {
            Ok(()) => Ok(true),
            Err(error) if error.is_conditional_check_failed() => {
                debug!(
                    expect_existing,
                    "Conditional checkpoint write failed; switching between insert and update"
                );
                self.store
                    .put_batch_state(&self.table_name, &item, !expect_existing)
                    .await
                    .map_err(Self::classify)?;
                Ok(true)
            }
            Err(error) => Err(Self::classify(error)),
        }
    }
}
