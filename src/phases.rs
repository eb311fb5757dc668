//! The three-phase orchestrator.
//!
//! One invocation runs initiate → process → finalise over a batch. Each
//! phase derives a deadline from the host's remaining time and races its
//! work against it; a lost race times out the phase's unfinalised tasks
//! with reversible-attempt semantics and moves on (process) or surfaces a
//! replay-triggering error (finalise). The finalise phase always attempts
//! to persist the checkpoint before the invocation's hard deadline.
//!
//! Phase deadlines: initiate and process use
//! `remaining * timeout_at_percentage_of_remaining_time`; finalise uses
//! `max(remaining - 1s, remaining * max(pct, 0.8))`, guaranteeing reserve
//! time for the save.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::batch::state::BatchKey;
use crate::batch::{
    Batch, BatchSummary, TaskDefs, FINALISE_BATCH_TASK, INITIATE_BATCH_TASK, PROCESS_BATCH_TASK,
};
use crate::checkpoint::{restore_batch, serialize_batch, CheckpointCodec};
use crate::client::{CheckpointStoreClient, DeadLetterStreamClient, EventSourceControlClient};
use crate::config::{ConsumerCallbacks, ConsumerConfig};
use crate::discard::{
    discard_rejected_message_to_dmq, discard_unusable_record_to_drq, handle_fatal_error,
};
use crate::error::ConsumerError;
use crate::lambda::{InvocationContext, StreamEvent};
use crate::task::{CompleteOpts, Task, TaskOutcome, TaskOutcomeKind, TimeoutOpts};

/// The stream consumer: configuration, callbacks and the cloud facades,
/// ready to process one batch per invocation.
pub struct StreamConsumer {
    config: Arc<ConsumerConfig>,
    callbacks: ConsumerCallbacks,
    store: Arc<dyn CheckpointStoreClient>,
    event_source_control: Arc<dyn EventSourceControlClient>,
}

/// Errors collected per phase, used to pick the surfaced error.
#[derive(Debug, Default)]
struct PhaseErrors {
    initiate: Option<ConsumerError>,
    process: Option<ConsumerError>,
    finalise: Option<ConsumerError>,
}

impl PhaseErrors {
    fn any_finalised_error(&self) -> bool {
        [&self.initiate, &self.process, &self.finalise]
            .iter()
            .any(|e| e.as_ref().map(|e| e.is_finalised()).unwrap_or(false))
    }

    /// The first process-phase or finalise-phase failure. Initiate-phase
    /// errors only steer control flow; they are not re-thrown by the
    /// replay policy.
    fn into_first(self) -> Option<ConsumerError> {
        self.process.or(self.finalise)
    }
}

fn first_failure(outcomes: &mut Vec<TaskOutcome>) -> Option<ConsumerError> {
    outcomes
        .iter_mut()
        .find(|o| o.kind == TaskOutcomeKind::Failed)
        .and_then(|o| o.error.take())
}

impl StreamConsumer {
    /// Creates a consumer, validating the configuration and callbacks and
    /// installing the default checkpoint codec and dead-letter handlers
    /// for any hook the caller did not supply.
    pub fn new(
        config: ConsumerConfig,
        callbacks: ConsumerCallbacks,
        store: Arc<dyn CheckpointStoreClient>,
        dead_letters: Arc<dyn DeadLetterStreamClient>,
        event_source_control: Arc<dyn EventSourceControlClient>,
    ) -> Result<Self, ConsumerError> {
        config.validate()?;
        callbacks.validate()?;

        let mut callbacks = callbacks;
        if callbacks.discard_unusable_record.is_none() {
            let client = dead_letters.clone();
            let stream_name = config.dead_record_queue();
            callbacks.discard_unusable_record = Some(Arc::new(move |envelope| {
                let client = client.clone();
                let stream_name = stream_name.clone();
                Box::pin(async move {
                    discard_unusable_record_to_drq(envelope, client.as_ref(), &stream_name).await
                })
            }));
        }
        if callbacks.discard_rejected_message.is_none() {
            let client = dead_letters.clone();
            let stream_name = config.dead_message_queue();
            callbacks.discard_rejected_message = Some(Arc::new(move |envelope| {
                let client = client.clone();
                let stream_name = stream_name.clone();
                Box::pin(async move {
                    discard_rejected_message_to_dmq(envelope, client.as_ref(), &stream_name).await
                })
            }));
        }

        Ok(Self {
            config: Arc::new(config),
            callbacks,
            store,
            event_source_control,
        })
    }

    fn codec(&self) -> CheckpointCodec {
        CheckpointCodec::new(self.store.clone(), self.config.batch_state_table())
    }

    fn phase_timeout(&self, context: &dyn InvocationContext) -> Duration {
        let remaining = context.remaining_time_millis();
        let pct = self.config.timeout_at_percentage_of_remaining_time;
        Duration::from_millis((remaining as f64 * pct) as u64)
    }

    fn finalise_timeout(&self, context: &dyn InvocationContext) -> Duration {
        let remaining = context.remaining_time_millis();
        let pct = self.config.timeout_at_percentage_of_remaining_time.max(0.8);
        let by_pct = (remaining as f64 * pct) as u64;
        Duration::from_millis(remaining.saturating_sub(1000).max(by_pct))
    }

    fn start_phase_task(task: &Option<Task>) {
        if let Some(task) = task {
            if let Err(e) = task.start() {
                debug!(error = %e, "Phase task start rejected");
            }
        }
    }

    fn complete_phase_task(task: &Option<Task>) {
        if let Some(task) = task {
            if let Err(e) = task.complete(serde_json::Value::Null, CompleteOpts::default()) {
                debug!(error = %e, "Phase task completion rejected");
            }
        }
    }

    fn fail_phase_task(task: &Option<Task>, error: &ConsumerError) {
        if let Some(task) = task {
            if let Err(e) = task.fail(error) {
                debug!(error = %e, "Phase task failure rejected");
            }
        }
    }

    fn timeout_phase_task(task: &Option<Task>, error: &ConsumerError) {
        if let Some(task) = task {
            let opts = TimeoutOpts { reverse_attempt: true, ..TimeoutOpts::default() };
            if let Err(e) = task.timeout(error, opts) {
                debug!(error = %e, "Phase task timeout rejected");
            }
        }
    }

    /// Processes one invocation's batch of records to completion.
    ///
    /// Returns the batch summary when every item reached a terminal
    /// outcome; otherwise returns the most indicative error so the host
    /// redelivers the same records. Fatal errors additionally disable the
    /// upstream event-source mapping before surfacing.
    pub async fn process_batch(
        &self,
        event: StreamEvent,
        context: &dyn InvocationContext,
    ) -> Result<BatchSummary, ConsumerError> {
        let source_stream_name = event
            .records
            .first()
            .and_then(|r| r.source_stream_name())
            .map(|s| s.to_string());

        match self.run(event, context).await {
            Ok(summary) => Ok(summary),
            Err(error) if error.is_fatal() => match source_stream_name {
                Some(stream) => Err(handle_fatal_error(
                    error,
                    self.event_source_control.as_ref(),
                    context.function_name(),
                    &stream,
                    self.config.avoid_esm_cache,
                )
                .await),
                None => {
                    error!(%error, "Fatal error with no resolvable source stream");
                    Err(error)
                }
            },
            Err(error) => Err(error),
        }
    }

    async fn run(
        &self,
        event: StreamEvent,
        context: &dyn InvocationContext,
    ) -> Result<BatchSummary, ConsumerError> {
        if event.records.is_empty() {
            info!("Received an empty batch of records; nothing to do");
            let key = BatchKey::new("", "");
            let batch = Batch::new(key, Vec::new(), TaskDefs::resolve(&self.callbacks)?);
            return Ok(batch.summarize_final_results(None));
        }

        let key = BatchKey::resolve(&event.records, &self.config, context)?;
        let task_defs = TaskDefs::resolve(&self.callbacks)?;
        let mut batch = Batch::new(key, event.records, task_defs);
        let mut errors = PhaseErrors::default();

        // Initiate phase: extract, sequence, load, restore, revive.
        let initiate_timeout = self.phase_timeout(context);
        let timed_out = {
            let work = self.initiate_phase_work(&mut batch);
            tokio::pin!(work);
            let deadline = sleep(initiate_timeout);
            tokio::pin!(deadline);
            tokio::select! {
                result = &mut work => {
                    match result {
                        Ok(()) => None,
                        Err(error) if error.is_fatal() => return Err(error),
                        // A transient load failure is re-raised as-is so the
                        // host redelivers; nothing has been processed yet and
                        // there is no progress worth saving.
                        Err(error) if error.is_transient() => return Err(error),
                        Err(error) => {
                            errors.initiate = Some(error);
                            None
                        }
                    }
                }
                _ = &mut deadline => Some(ConsumerError::timeout_reversible(format!(
                    "Initiate phase timed out after {initiate_timeout:?}"
                ))),
            }
        };
        let initiate_task = batch.state().initiating.get(INITIATE_BATCH_TASK).cloned();
        Self::start_phase_task(&initiate_task);
        if let Some(timeout_error) = timed_out {
            warn!(%timeout_error, "Initiate phase lost its deadline race");
            Self::timeout_phase_task(&initiate_task, &timeout_error);
            errors.initiate = Some(timeout_error);
        } else if let Some(initiate_error) = &errors.initiate {
            Self::fail_phase_task(&initiate_task, initiate_error);
        } else {
            Self::complete_phase_task(&initiate_task);
        }

        // Process phase: chains, batch-wide tasks and unusable discards,
        // raced against the deadline. Skipped when initiate failed.
        if errors.initiate.is_none() {
            let process_task = batch.state().processing.get(PROCESS_BATCH_TASK).cloned();
            Self::start_phase_task(&process_task);

            let process_timeout = self.phase_timeout(context);
            let (mut outcomes, hook_error, timed_out) = {
                let work = self.process_phase_work(&batch);
                tokio::pin!(work);
                let deadline = sleep(process_timeout);
                tokio::pin!(deadline);
                tokio::select! {
                    (outcomes, hook_error) = &mut work => (outcomes, hook_error, None),
                    _ = &mut deadline => (
                        Vec::new(),
                        None,
                        Some(ConsumerError::timeout_reversible(format!(
                            "Process phase timed out after {process_timeout:?}"
                        ))),
                    ),
                }
            };
            if let Some(timeout_error) = timed_out {
                warn!(%timeout_error, progress = ?batch.assess_progress(),
                    "Process phase lost its deadline race; timing out unfinalised tasks");
                batch.timeout_processing_tasks(&timeout_error);
                errors.process = Some(timeout_error);
            } else {
                let failure = first_failure(&mut outcomes).or(hook_error);
                match &failure {
                    Some(process_error) => {
                        debug!(%process_error, "Process phase collected a failure");
                        Self::fail_phase_task(&process_task, process_error);
                    }
                    None => Self::complete_phase_task(&process_task),
                }
                errors.process = failure;
            }
        }

        // Finalise phase: freeze, discard rejected, save the checkpoint.
        let finalise_task = batch.state().finalising.get(FINALISE_BATCH_TASK).cloned();
        Self::start_phase_task(&finalise_task);

        let already_finalised = batch.is_fully_finalised();
        let finalise_timeout = self.finalise_timeout(context);
        let finalise_result = {
            let work = self.finalise_phase_work(&mut batch, already_finalised);
            tokio::pin!(work);
            let deadline = sleep(finalise_timeout);
            tokio::pin!(deadline);
            tokio::select! {
                result = &mut work => result,
                _ = &mut deadline => Err(ConsumerError::timeout(format!(
                    "Finalise phase timed out after {finalise_timeout:?}"
                ))),
            }
        };
        match finalise_result {
            Ok(mut outcomes) => {
                errors.finalise = first_failure(&mut outcomes);
                match &errors.finalise {
                    Some(finalise_error) => Self::fail_phase_task(&finalise_task, finalise_error),
                    None => Self::complete_phase_task(&finalise_task),
                }
            }
            Err(error) if error.is_timeout() => {
                warn!(%error, "Finalise phase lost its deadline race");
                batch.timeout_finalising_tasks(&ConsumerError::timeout_reversible(
                    error.to_string(),
                ));
                errors.finalise = Some(error);
            }
            Err(error) if error.is_fatal() => return Err(error),
            Err(error) => {
                // Transient save errors revert the phase attempt so retry
                // budget is preserved across redeliveries.
                if error.is_transient() {
                    Self::timeout_phase_task(
                        &finalise_task,
                        &ConsumerError::timeout_reversible(error.to_string()),
                    );
                } else {
                    Self::fail_phase_task(&finalise_task, &error);
                }
                errors.finalise = Some(error);
            }
        }

        // Replay policy: anything that leaves the batch unfinalised is
        // re-raised so the host redelivers the same records.
        let fully_finalised = batch.is_fully_finalised();
        if fully_finalised && errors.finalise.is_none() {
            let summary = batch.summarize_final_results(None);
            info!(progress = ?batch.assess_progress(), "{} is fully finalised", batch.describe());
            return Ok(summary);
        }

        if errors.any_finalised_error() {
            let error = ConsumerError::fatal(format!(
                "A task transition was rejected on a finalised task while handling {}",
                batch.describe()
            ));
            return Err(error);
        }
        let error = errors.into_first().unwrap_or_else(|| {
            ConsumerError::incomplete(format!("{} is still incomplete", batch.describe()))
        });
        warn!(%error, summary = ?batch.summarize_final_results(Some(&error)),
            "Batch not fully finalised; surfacing error to trigger redelivery");
        Err(error)
    }

    async fn initiate_phase_work(&self, batch: &mut Batch) -> Result<(), ConsumerError> {
        // Extract messages from every record.
        for index in 0..batch.records().len() {
            let record = batch.records()[index].clone();
            match self.callbacks.extract(&record) {
                Ok(extracted) => {
                    for one in extracted {
                        batch.add_message(
                            one.message,
                            Some(index),
                            one.user_record,
                            &self.config,
                            &self.callbacks,
                        )?;
                    }
                }
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => {
                    batch.add_unusable_record(
                        Some(index),
                        None,
                        error.to_string(),
                        &self.callbacks,
                    );
                }
            }
        }

        batch.sequence(&self.config)?;

        // Load any prior checkpoint and overlay it onto the current items.
        let loaded = match &self.callbacks.load_batch_state {
            Some(load) => load(batch.key().clone()).await?,
            None => self.codec().load(batch.key()).await?,
        };
        match loaded {
            Some(prior) => {
                debug!("Prior batch state loaded; restoring task trees");
                batch.set_previously_saved(Some(true));
                restore_batch(batch, prior);
            }
            None => {
                debug!("No prior batch state; proceeding as a new batch");
                batch.set_previously_saved(Some(false));
            }
        }

        batch.revive_tasks();
        info!("Initiated {}", batch.describe());

        if let Some(hook) = &self.callbacks.pre_process_batch {
            hook(batch).await?;
        }
        Ok(())
    }

    async fn process_phase_work(
        &self,
        batch: &Batch,
    ) -> (Vec<TaskOutcome>, Option<ConsumerError>) {
        let heads = batch.first_messages_to_process().to_vec();
        let chains = join_all(heads.into_iter().map(|head| batch.process_chain(head)));
        let alls = batch.process_all_tasks();
        let discards = batch.discard_unusable_records();
        let (chain_outcomes, all_outcomes, discard_outcomes) =
            tokio::join!(chains, alls, discards);

        let mut outcomes: Vec<TaskOutcome> = chain_outcomes.into_iter().flatten().collect();
        outcomes.extend(all_outcomes);
        outcomes.extend(discard_outcomes);

        let hook_error = match &self.callbacks.pre_finalise_batch {
            Some(hook) => hook(batch).await.err(),
            None => None,
        };
        (outcomes, hook_error)
    }

    async fn finalise_phase_work(
        &self,
        batch: &mut Batch,
        already_finalised: bool,
    ) -> Result<Vec<TaskOutcome>, ConsumerError> {
        let max_attempts = self.config.max_number_of_attempts;

        // Settle the processing trees before freezing them.
        let discarded = batch.discard_processing_tasks_if_over_attempted(max_attempts);
        if discarded > 0 {
            info!(discarded, "Discarded over-attempted processing tasks");
        }
        batch.abandon_dead_processing_tasks();
        batch.freeze_processing_tasks();

        let mut outcomes = batch.discard_rejected_messages().await;

        batch.discard_finalising_tasks_if_over_attempted(max_attempts);
        batch.abandon_dead_finalising_tasks();
        batch.freeze_finalising_tasks();

        // Persist progress before the invocation's hard deadline. A batch
        // that arrived fully finalised and produced no new outcomes has
        // nothing new to persist.
        if already_finalised && outcomes.is_empty() && batch.previously_saved() == Some(true) {
            debug!("Batch was already fully finalised; skipping checkpoint save");
        } else {
            let item = serialize_batch(batch);
            let previously_saved = batch.previously_saved();
            let saved = match &self.callbacks.save_batch_state {
                Some(save) => save(item, previously_saved).await?,
                None => self.codec().save(item, previously_saved).await?,
            };
            batch.set_previously_saved(Some(saved));
            debug!("Saved checkpoint for {}", batch.describe());
        }

        if let Some(hook) = &self.callbacks.post_finalise_batch {
            if let Err(hook_error) = hook(batch).await {
                outcomes.push(TaskOutcome {
                    name: "postFinaliseBatch".to_string(),
                    kind: TaskOutcomeKind::Failed,
                    result: None,
                    error: Some(hook_error),
                });
            }
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_errors_pick_first() {
        let errors = PhaseErrors {
            initiate: None,
            process: Some(ConsumerError::task_failure("t", "boom")),
            finalise: Some(ConsumerError::timeout("late")),
        };
        assert!(matches!(errors.into_first(), Some(ConsumerError::TaskFailure { .. })));
    }

    #[test]
    fn test_phase_errors_exclude_initiate_from_fallback() {
        // Initiate errors steer control flow but are never re-thrown; an
        // unfinalised batch without process/finalise failures falls back
        // to the generic incomplete error instead.
        let errors = PhaseErrors {
            initiate: Some(ConsumerError::validation("sort kind conflict")),
            process: None,
            finalise: None,
        };
        assert!(errors.into_first().is_none());
    }

    #[test]
    fn test_phase_errors_detect_finalised() {
        let errors = PhaseErrors {
            initiate: None,
            process: Some(ConsumerError::Frozen { task_name: "t".to_string() }),
            finalise: None,
        };
        assert!(errors.any_finalised_error());
    }

    #[test]
    fn test_first_failure_takes_error() {
        let mut outcomes = vec![
            TaskOutcome {
                name: "a".to_string(),
                kind: TaskOutcomeKind::Completed,
                result: None,
                error: None,
            },
            TaskOutcome {
                name: "b".to_string(),
                kind: TaskOutcomeKind::Failed,
                result: None,
                error: Some(ConsumerError::task_failure("b", "boom")),
            },
        ];
        let failure = first_failure(&mut outcomes).unwrap();
        assert!(matches!(failure, ConsumerError::TaskFailure { .. }));
        assert!(outcomes[1].error.is_none());
    }
}
