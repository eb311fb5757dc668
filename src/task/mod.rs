//! The hierarchical task engine.
//!
//! Tasks are nodes in a tree built from [`TaskDef`] templates. Each task
//! carries a lifecycle state, attempt counters, begin/end timestamps, an
//! optional frozen flag and an optional slave list for master/slave
//! mirroring of batch-wide tasks onto per-message tasks.
//!
//! Every finalized outcome is absorbing unless an explicit override flag is
//! passed; a frozen task rejects all further transitions; a task is *fully
//! finalised* iff its own state is terminal and every descendant is fully
//! finalised.
//!
//! Tasks are shared-mutability handles (`Arc<Mutex<..>>`): the batch, its
//! state maps and any in-flight executor may all hold a handle to the same
//! node. Locks are held only for the duration of a single transition and
//! never across awaits.

mod def;

pub use def::{BatchScope, ExecuteFn, MessageScope, TaskDef, TaskInput};

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{ConsumerError, ErrorInfo};

/// The lifecycle state of a task.
///
/// `Completed`, `Rejected`, `Discarded` and `Abandoned` are terminal;
/// `Failed` and `TimedOut` are retryable non-terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TaskStateKind {
    /// Not yet started (or reset for retry)
    #[serde(rename = "UNSTARTED")]
    Unstarted = 0,
    /// Started and in progress
    #[serde(rename = "STARTED")]
    Started = 1,
    /// Completed successfully (terminal)
    #[serde(rename = "COMPLETED")]
    Completed = 2,
    /// Failed; will be retried on redelivery
    #[serde(rename = "FAILED")]
    Failed = 3,
    /// Timed out; will be retried on redelivery
    #[serde(rename = "TIMED_OUT")]
    TimedOut = 4,
    /// Rejected by the domain (terminal)
    #[serde(rename = "REJECTED")]
    Rejected = 5,
    /// Discarded after exhausting the retry budget (terminal)
    #[serde(rename = "DISCARDED")]
    Discarded = 6,
    /// Abandoned as a dead task (terminal)
    #[serde(rename = "ABANDONED")]
    Abandoned = 7,
}

impl TaskStateKind {
    /// Returns true if this state is terminal.
    pub fn is_finalised(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Discarded | Self::Abandoned)
    }

    /// Returns true if this is a retryable non-terminal failure state.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }

    /// Returns true if this is one of the rejection-family terminal states.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected | Self::Discarded | Self::Abandoned)
    }
}

impl std::fmt::Display for TaskStateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unstarted => write!(f, "Unstarted"),
            Self::Started => write!(f, "Started"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
            Self::TimedOut => write!(f, "TimedOut"),
            Self::Rejected => write!(f, "Rejected"),
            Self::Discarded => write!(f, "Discarded"),
            Self::Abandoned => write!(f, "Abandoned"),
        }
    }
}

/// Options for the `complete` transition.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompleteOpts {
    /// Complete even if the task is currently timed out
    pub override_timed_out: bool,
}

/// Options for the `timeout` transition.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutOpts {
    /// Time out even a completed task
    pub override_completed: bool,
    /// Time out even an unstarted task
    pub override_unstarted: bool,
    /// Reverse the in-progress attempt so retry budget is preserved
    pub reverse_attempt: bool,
}

/// The mode used when reviving task trees from persisted snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviveMode {
    /// Only reconstitute tasks that have a snapshot
    OnlyExisting,
    /// Reconstitute snapshot tasks and create missing templates fresh
    CreateMissing,
}

/// The storable projection of a task's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStateSnapshot {
    /// The state kind
    #[serde(rename = "kind")]
    pub kind: TaskStateKind,
    /// The last error, for failure states
    #[serde(rename = "error", skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// The reason, for rejection-family states
    #[serde(rename = "reason", skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The storable projection of a task subtree (a "task-like" object).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// The task name
    #[serde(rename = "name")]
    pub name: String,
    /// The task state
    #[serde(rename = "state")]
    pub state: TaskStateSnapshot,
    /// Attempts consumed from the retry budget
    #[serde(rename = "attempts")]
    pub attempts: u32,
    /// Monotone count of all attempts, including reversed ones
    #[serde(rename = "totalAttempts", default)]
    pub total_attempts: u32,
    /// Millisecond epoch timestamp of the last start
    #[serde(rename = "beganAt", skip_serializing_if = "Option::is_none")]
    pub began_at: Option<i64>,
    /// Millisecond epoch timestamp of the last terminal/failure transition
    #[serde(rename = "endedAt", skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    /// Snapshots of the sub-tasks
    #[serde(rename = "subTasks", default, skip_serializing_if = "Vec::is_empty")]
    pub sub_tasks: Vec<TaskSnapshot>,
}

struct TaskInner {
    name: String,
    state: TaskStateKind,
    last_error: Option<ErrorInfo>,
    reason: Option<String>,
    result: Option<Value>,
    attempts: u32,
    total_attempts: u32,
    began_at: Option<i64>,
    ended_at: Option<i64>,
    frozen: bool,
    /// False for tasks revived from a snapshot with no matching template
    executable: bool,
    execute: Option<ExecuteFn>,
    sub_tasks: Vec<Task>,
    slaves: Vec<Task>,
}

/// A live task node. Cheap to clone; clones share the same state cell.
#[derive(Clone)]
pub struct Task(Arc<Mutex<TaskInner>>);

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner();
        f.debug_struct("Task")
            .field("name", &inner.name)
            .field("state", &inner.state)
            .field("attempts", &inner.attempts)
            .field("frozen", &inner.frozen)
            .field("sub_tasks", &inner.sub_tasks.len())
            .finish()
    }
}

/// The kind of outcome produced by executing a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcomeKind {
    /// The executor succeeded and the task completed
    Completed,
    /// The executor failed and the task failed
    Failed,
    /// The executor returned a domain rejection and the task was rejected
    Rejected,
    /// The task was already fully finalised; nothing executed
    Finalised,
    /// The task could not execute (frozen, or no executor)
    Skipped,
}

/// The outcome of executing one task.
#[derive(Debug)]
pub struct TaskOutcome {
    /// The task's name
    pub name: String,
    /// The kind of outcome
    pub kind: TaskOutcomeKind,
    /// The executor's value, when completed
    pub result: Option<Value>,
    /// The failure, when failed or rejected
    pub error: Option<ConsumerError>,
}

impl TaskOutcome {
    fn new(name: impl Into<String>, kind: TaskOutcomeKind) -> Self {
        Self { name: name.into(), kind, result: None, error: None }
    }

    /// Returns true if this outcome carries a failure.
    pub fn is_failure(&self) -> bool {
        matches!(self.kind, TaskOutcomeKind::Failed)
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl Task {
    /// Builds a fresh task subtree from a template.
    pub fn from_def(def: &TaskDef) -> Self {
        let sub_tasks = def.sub_task_defs().iter().map(Task::from_def).collect();
        Self(Arc::new(Mutex::new(TaskInner {
            name: def.name().to_string(),
            state: TaskStateKind::Unstarted,
            last_error: None,
            reason: None,
            result: None,
            attempts: 0,
            total_attempts: 0,
            began_at: None,
            ended_at: None,
            frozen: false,
            executable: true,
            execute: def.execute().cloned(),
            sub_tasks,
            slaves: Vec::new(),
        })))
    }

    /// Reconstitutes a task subtree from a template and/or a persisted
    /// snapshot, merging snapshot fields into the live node.
    ///
    /// A snapshot without a matching template yields an *unusable* task
    /// (no executor) so that [`Task::abandon_dead`] can later release it.
    pub fn revive(def: Option<&TaskDef>, snapshot: Option<&TaskSnapshot>) -> Option<Self> {
        let name = match (def, snapshot) {
            (Some(def), _) => def.name().to_string(),
            (None, Some(snapshot)) => snapshot.name.clone(),
            (None, None) => return None,
        };

        let mut sub_tasks = Vec::new();
        let empty: Vec<TaskSnapshot> = Vec::new();
        let sub_snapshots = snapshot.map(|s| &s.sub_tasks).unwrap_or(&empty);
        if let Some(def) = def {
            for sub_def in def.sub_task_defs() {
                let sub_snapshot = sub_snapshots.iter().find(|s| s.name == sub_def.name());
                if let Some(task) = Task::revive(Some(sub_def), sub_snapshot) {
                    sub_tasks.push(task);
                }
            }
            for sub_snapshot in sub_snapshots {
                if !def.sub_task_defs().iter().any(|d| d.name() == sub_snapshot.name) {
                    if let Some(task) = Task::revive(None, Some(sub_snapshot)) {
                        sub_tasks.push(task);
                    }
                }
            }
        } else {
            for sub_snapshot in sub_snapshots {
                if let Some(task) = Task::revive(None, Some(sub_snapshot)) {
                    sub_tasks.push(task);
                }
            }
        }

        let mut inner = TaskInner {
            name,
            state: TaskStateKind::Unstarted,
            last_error: None,
            reason: None,
            result: None,
            attempts: 0,
            total_attempts: 0,
            began_at: None,
            ended_at: None,
            frozen: false,
            executable: def.is_some(),
            execute: def.and_then(|d| d.execute().cloned()),
            sub_tasks,
            slaves: Vec::new(),
        };
        if let Some(snapshot) = snapshot {
            inner.state = snapshot.state.kind;
            inner.last_error = snapshot.state.error.clone();
            inner.reason = snapshot.state.reason.clone();
            inner.attempts = snapshot.attempts;
            inner.total_attempts = snapshot.total_attempts.max(snapshot.attempts);
            inner.began_at = snapshot.began_at;
            inner.ended_at = snapshot.ended_at;
        }
        Some(Self(Arc::new(Mutex::new(inner))))
    }

    fn inner(&self) -> MutexGuard<'_, TaskInner> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the task's name.
    pub fn name(&self) -> String {
        self.inner().name.clone()
    }

    /// Returns the task's current state.
    pub fn state(&self) -> TaskStateKind {
        self.inner().state
    }

    /// Returns the attempts consumed from the retry budget.
    pub fn attempts(&self) -> u32 {
        self.inner().attempts
    }

    /// Returns the monotone total attempt count.
    pub fn total_attempts(&self) -> u32 {
        self.inner().total_attempts
    }

    /// Returns the last error, if any.
    pub fn last_error(&self) -> Option<ErrorInfo> {
        self.inner().last_error.clone()
    }

    /// Returns the rejection/abandonment reason, if any.
    pub fn reason(&self) -> Option<String> {
        self.inner().reason.clone()
    }

    /// Returns the completed result, if any.
    pub fn result(&self) -> Option<Value> {
        self.inner().result.clone()
    }

    /// Returns true if the task is frozen.
    pub fn is_frozen(&self) -> bool {
        self.inner().frozen
    }

    /// Returns true if this task was revived without a matching template.
    pub fn is_unusable(&self) -> bool {
        !self.inner().executable
    }

    /// Returns the task's direct sub-tasks.
    pub fn sub_tasks(&self) -> Vec<Task> {
        self.inner().sub_tasks.clone()
    }

    /// Finds a direct sub-task by name.
    pub fn sub_task(&self, name: &str) -> Option<Task> {
        self.inner().sub_tasks.iter().find(|t| t.name() == name).cloned()
    }

    /// Installs the slave list of a master task. Every subsequent state
    /// transition on the master is replayed onto each slave.
    pub fn set_slaves(&self, slaves: Vec<Task>) {
        self.inner().slaves = slaves;
    }

    /// Returns the master's slaves.
    pub fn slaves(&self) -> Vec<Task> {
        self.inner().slaves.clone()
    }

    /// Returns true if this task's own state is terminal.
    pub fn is_finalised(&self) -> bool {
        self.inner().state.is_finalised()
    }

    /// Returns true if this task and every descendant is terminal.
    pub fn is_fully_finalised(&self) -> bool {
        let (finalised, sub_tasks) = {
            let inner = self.inner();
            (inner.state.is_finalised(), inner.sub_tasks.clone())
        };
        finalised && sub_tasks.iter().all(Task::is_fully_finalised)
    }

    /// Returns true if this subtree contains a rejection-family outcome.
    pub fn contains_rejection(&self) -> bool {
        let (rejected, sub_tasks) = {
            let inner = self.inner();
            (inner.state.is_rejection(), inner.sub_tasks.clone())
        };
        rejected || sub_tasks.iter().any(Task::contains_rejection)
    }

    fn frozen_error(inner: &TaskInner) -> ConsumerError {
        ConsumerError::Frozen { task_name: inner.name.clone() }
    }

    /// Starts (or restarts) the task, counting an attempt.
    ///
    /// Finalised states are absorbing; an already-started task is left
    /// alone. Returns whether the transition was applied.
    pub fn start(&self) -> Result<bool, ConsumerError> {
        let (applied, slaves) = {
            let mut inner = self.inner();
            if inner.frozen {
                return Err(Self::frozen_error(&inner));
            }
            match inner.state {
                TaskStateKind::Unstarted | TaskStateKind::Failed | TaskStateKind::TimedOut => {
                    inner.state = TaskStateKind::Started;
                    inner.attempts += 1;
                    inner.total_attempts += 1;
                    inner.began_at = Some(now_millis());
                    inner.ended_at = None;
                    (true, inner.slaves.clone())
                }
                _ => (false, Vec::new()),
            }
        };
        for slave in slaves {
            if let Err(error) = slave.start() {
                debug!(slave = %slave.name(), %error, "Slave start rejected");
            }
        }
        Ok(applied)
    }

    /// Completes the task with a result.
    pub fn complete(&self, result: Value, opts: CompleteOpts) -> Result<bool, ConsumerError> {
        let (applied, slaves) = {
            let mut inner = self.inner();
            if inner.frozen {
                return Err(Self::frozen_error(&inner));
            }
            match inner.state {
                TaskStateKind::Completed => (false, Vec::new()),
                s if s.is_rejection() => {
                    return Err(ConsumerError::Finalised {
                        task_name: inner.name.clone(),
                        state_name: s.to_string(),
                    });
                }
                TaskStateKind::TimedOut if !opts.override_timed_out => (false, Vec::new()),
                _ => {
                    inner.state = TaskStateKind::Completed;
                    inner.result = Some(result.clone());
                    inner.last_error = None;
                    inner.ended_at = Some(now_millis());
                    (true, inner.slaves.clone())
                }
            }
        };
        for slave in slaves {
            if let Err(error) = slave.complete(result.clone(), opts) {
                debug!(slave = %slave.name(), %error, "Slave complete rejected");
            }
        }
        Ok(applied)
    }

    /// Fails the task with an error. Finalised states are absorbing.
    pub fn fail(&self, error: &ConsumerError) -> Result<bool, ConsumerError> {
        let info = ErrorInfo::from(error);
        let (applied, slaves) = {
            let mut inner = self.inner();
            if inner.frozen {
                return Err(Self::frozen_error(&inner));
            }
            if inner.state.is_finalised() {
                (false, Vec::new())
            } else {
                inner.state = TaskStateKind::Failed;
                inner.last_error = Some(info.clone());
                inner.ended_at = Some(now_millis());
                (true, inner.slaves.clone())
            }
        };
        for slave in slaves {
            if let Err(slave_error) = slave.fail(error) {
                debug!(slave = %slave.name(), error = %slave_error, "Slave fail rejected");
            }
        }
        Ok(applied)
    }

    /// Times the task out.
    ///
    /// Completed and rejection-family states absorb the timeout unless the
    /// corresponding override is set; an unstarted task is only timed out
    /// with `override_unstarted`. With `reverse_attempt`, a timeout that
    /// interrupts an in-progress attempt refunds it.
    pub fn timeout(&self, error: &ConsumerError, opts: TimeoutOpts) -> Result<bool, ConsumerError> {
        let info = ErrorInfo::from(error);
        let (applied, slaves) = {
            let mut inner = self.inner();
            if inner.frozen {
                return Err(Self::frozen_error(&inner));
            }
            let applies = match inner.state {
                TaskStateKind::Completed => opts.override_completed,
                s if s.is_rejection() => false,
                TaskStateKind::Unstarted => opts.override_unstarted,
                _ => true,
            };
            if !applies {
                (false, Vec::new())
            } else {
                if opts.reverse_attempt
                    && inner.state == TaskStateKind::Started
                    && inner.attempts > 0
                {
                    inner.attempts -= 1;
                }
                inner.state = TaskStateKind::TimedOut;
                inner.last_error = Some(info.clone());
                inner.ended_at = Some(now_millis());
                (true, inner.slaves.clone())
            }
        };
        for slave in slaves {
            if let Err(slave_error) = slave.timeout(error, opts) {
                debug!(slave = %slave.name(), error = %slave_error, "Slave timeout rejected");
            }
        }
        Ok(applied)
    }

    /// Rejects the task with a domain-level reason (terminal).
    pub fn reject(&self, reason: impl Into<String>) -> Result<bool, ConsumerError> {
        let reason = reason.into();
        let (applied, slaves) = {
            let mut inner = self.inner();
            if inner.frozen {
                return Err(Self::frozen_error(&inner));
            }
            if inner.state.is_finalised() {
                (false, Vec::new())
            } else {
                inner.state = TaskStateKind::Rejected;
                inner.reason = Some(reason.clone());
                inner.ended_at = Some(now_millis());
                (true, inner.slaves.clone())
            }
        };
        for slave in slaves {
            if let Err(error) = slave.reject(reason.clone()) {
                debug!(slave = %slave.name(), %error, "Slave reject rejected");
            }
        }
        Ok(applied)
    }

    /// Discards the task (terminal; used when the retry budget is spent).
    pub fn discard(&self) -> Result<bool, ConsumerError> {
        let (applied, slaves) = {
            let mut inner = self.inner();
            if inner.frozen {
                return Err(Self::frozen_error(&inner));
            }
            if inner.state.is_finalised() {
                (false, Vec::new())
            } else {
                inner.state = TaskStateKind::Discarded;
                inner.ended_at = Some(now_millis());
                (true, inner.slaves.clone())
            }
        };
        for slave in slaves {
            if let Err(error) = slave.discard() {
                debug!(slave = %slave.name(), %error, "Slave discard rejected");
            }
        }
        Ok(applied)
    }

    /// Abandons the task (terminal; used to release dead tasks).
    pub fn abandon(&self, reason: impl Into<String>) -> Result<bool, ConsumerError> {
        let reason = reason.into();
        let (applied, slaves) = {
            let mut inner = self.inner();
            if inner.frozen {
                return Err(Self::frozen_error(&inner));
            }
            if inner.state.is_finalised() {
                (false, Vec::new())
            } else {
                inner.state = TaskStateKind::Abandoned;
                inner.reason = Some(reason.clone());
                inner.ended_at = Some(now_millis());
                (true, inner.slaves.clone())
            }
        };
        for slave in slaves {
            if let Err(error) = slave.abandon(reason.clone()) {
                debug!(slave = %slave.name(), %error, "Slave abandon rejected");
            }
        }
        Ok(applied)
    }

    /// Freezes the task, its subtree and its slaves. Idempotent. A frozen
    /// task admits no further state transitions.
    pub fn freeze(&self) {
        let (sub_tasks, slaves) = {
            let mut inner = self.inner();
            inner.frozen = true;
            (inner.sub_tasks.clone(), inner.slaves.clone())
        };
        for sub_task in sub_tasks {
            sub_task.freeze();
        }
        for slave in slaves {
            slave.freeze();
        }
    }

    /// Discards this task (and recursively its subtree) if it is
    /// over-attempted: a retryable non-terminal state, attempts at or over
    /// the cap, and (when required) no unfinalised children.
    ///
    /// Returns the number of tasks discarded.
    pub fn discard_if_over_attempted(
        &self,
        max_attempts: u32,
        only_with_finalised_children: bool,
    ) -> usize {
        let mut discarded = 0;
        for sub_task in self.sub_tasks() {
            discarded += sub_task.discard_if_over_attempted(max_attempts, only_with_finalised_children);
        }
        let eligible = {
            let inner = self.inner();
            let retryable = matches!(
                inner.state,
                TaskStateKind::Failed | TaskStateKind::TimedOut
            ) || (inner.state == TaskStateKind::Unstarted && inner.attempts > 0);
            let children_ok = !only_with_finalised_children
                || inner.sub_tasks.iter().all(Task::is_fully_finalised);
            retryable && children_ok && inner.attempts >= max_attempts
        };
        if eligible {
            match self.discard() {
                Ok(true) => {
                    self.inner().reason = Some(format!(
                        "Discarded after reaching the maximum of {max_attempts} attempts"
                    ));
                    discarded += 1;
                }
                Ok(false) => {}
                Err(error) => {
                    debug!(task = %self.name(), %error, "Over-attempted discard rejected"
                    );
                }
            }
        }
        discarded
    }

    fn is_finalised_ignoring_dead(&self) -> bool {
        let (ok, sub_tasks) = {
            let inner = self.inner();
            let own_ok = inner.state.is_finalised()
                || (!inner.executable && inner.state == TaskStateKind::Unstarted);
            (own_ok, inner.sub_tasks.clone())
        };
        ok && sub_tasks.iter().all(Task::is_finalised_ignoring_dead)
    }

    fn abandon_dead_nodes(&self, reason: &str) -> usize {
        let mut abandoned = 0;
        for sub_task in self.sub_tasks() {
            abandoned += sub_task.abandon_dead_nodes(reason);
        }
        let dead = {
            let inner = self.inner();
            !inner.executable && inner.state == TaskStateKind::Unstarted
        };
        if dead {
            match self.abandon(reason) {
                Ok(true) => abandoned += 1,
                Ok(false) => {}
                Err(error) => {
                    debug!(task = %self.name(), %error, "Dead-task abandon rejected");
                }
            }
        }
        abandoned
    }

    /// Abandons unstarted, unusable tasks in this tree when they are all
    /// that keeps the root from being fully finalised.
    ///
    /// Returns the number of tasks abandoned.
    pub fn abandon_dead(&self, reason: impl Into<String>) -> usize {
        if self.is_fully_finalised() || !self.is_finalised_ignoring_dead() {
            return 0;
        }
        self.abandon_dead_nodes(&reason.into())
    }

    /// Projects this task subtree to its storable snapshot.
    pub fn to_snapshot(&self) -> TaskSnapshot {
        let inner = self.inner();
        TaskSnapshot {
            name: inner.name.clone(),
            state: TaskStateSnapshot {
                kind: inner.state,
                error: inner.last_error.clone(),
                reason: inner.reason.clone(),
            },
            attempts: inner.attempts,
            total_attempts: inner.total_attempts,
            began_at: inner.began_at,
            ended_at: inner.ended_at,
            sub_tasks: inner.sub_tasks.iter().map(Task::to_snapshot).collect(),
        }
    }

    /// Executes one attempt of this task against the given input.
    ///
    /// A fully finalised task is skipped without running its executor; a
    /// successful executor completes the task, a domain rejection rejects
    /// it, any other failure fails it (counting the attempt).
    pub async fn execute(&self, input: TaskInput) -> TaskOutcome {
        let name = self.name();
        if self.is_fully_finalised() {
            return TaskOutcome::new(name, TaskOutcomeKind::Finalised);
        }
        let Some(execute) = self.inner().execute.clone() else {
            return TaskOutcome::new(name, TaskOutcomeKind::Skipped);
        };
        if let Err(error) = self.start() {
            debug!(task = %name, %error, "Task start rejected");
            return TaskOutcome::new(name, TaskOutcomeKind::Skipped);
        }

        match execute(input).await {
            Ok(value) => {
                let mut outcome = match self.complete(value.clone(), CompleteOpts::default()) {
                    Ok(_) => TaskOutcome::new(name.clone(), TaskOutcomeKind::Completed),
                    Err(error) => {
                        let mut outcome = TaskOutcome::new(name.clone(), TaskOutcomeKind::Skipped);
                        outcome.error = Some(error);
                        outcome
                    }
                };
                if outcome.kind == TaskOutcomeKind::Completed {
                    outcome.result = Some(value);
                }
                outcome
            }
            Err(error) if error.is_rejection() => {
                let reason = error.to_string();
                if let Err(transition_error) = self.reject(reason) {
                    debug!(task = %name, error = %transition_error, "Reject transition failed");
                }
                let mut outcome = TaskOutcome::new(name, TaskOutcomeKind::Rejected);
                outcome.error = Some(error);
                outcome
            }
            Err(error) => {
                if let Err(transition_error) = self.fail(&error) {
                    debug!(task = %name, error = %transition_error, "Fail transition failed");
                }
                let mut outcome = TaskOutcome::new(name, TaskOutcomeKind::Failed);
                outcome.error = Some(error);
                outcome
            }
        }
    }
}

/// Revives a whole task map from templates and prior snapshots.
///
/// Snapshot entries without a matching template are reconstituted as
/// unusable tasks; with [`ReviveMode::CreateMissing`], templates without a
/// snapshot are created fresh.
pub fn revive_task_map(
    defs: &[TaskDef],
    prior: &BTreeMap<String, TaskSnapshot>,
    mode: ReviveMode,
) -> BTreeMap<String, Task> {
    let mut tasks = BTreeMap::new();
    for def in defs {
        let snapshot = prior.get(def.name());
        if snapshot.is_none() && mode == ReviveMode::OnlyExisting {
            continue;
        }
        if let Some(task) = Task::revive(Some(def), snapshot) {
            tasks.insert(def.name().to_string(), task);
        }
    }
    for (name, snapshot) in prior {
        if !tasks.contains_key(name) {
            if let Some(task) = Task::revive(None, Some(snapshot)) {
                tasks.insert(name.clone(), task);
            }
        }
    }
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn noop_def(name: &str) -> TaskDef {
        TaskDef::new(name, Arc::new(|_| Box::pin(async { Ok(Value::Null) })))
            .expect("valid task def")
    }

    fn message_input() -> TaskInput {
        TaskInput::Batch(BatchScope {
            messages: vec![],
            batch_key: crate::batch::state::BatchKey::new("K|S|c", "S|shard-0"),
        })
    }

    #[test]
    fn test_state_kind_classification() {
        assert!(TaskStateKind::Completed.is_finalised());
        assert!(TaskStateKind::Rejected.is_finalised());
        assert!(TaskStateKind::Discarded.is_finalised());
        assert!(TaskStateKind::Abandoned.is_finalised());
        assert!(!TaskStateKind::Failed.is_finalised());
        assert!(!TaskStateKind::TimedOut.is_finalised());
        assert!(TaskStateKind::Failed.is_failure());
        assert!(TaskStateKind::Discarded.is_rejection());
        assert!(!TaskStateKind::Completed.is_rejection());
    }

    #[test]
    fn test_start_counts_attempt() {
        let task = Task::from_def(&noop_def("t"));
        assert_eq!(task.attempts(), 0);
        assert!(task.start().unwrap());
        assert_eq!(task.state(), TaskStateKind::Started);
        assert_eq!(task.attempts(), 1);
        // Starting an already-started task is ignored.
        assert!(!task.start().unwrap());
        assert_eq!(task.attempts(), 1);
    }

    #[test]
    fn test_complete_is_absorbing() {
        let task = Task::from_def(&noop_def("t"));
        task.start().unwrap();
        assert!(task.complete(json!(1), CompleteOpts::default()).unwrap());
        assert_eq!(task.state(), TaskStateKind::Completed);
        // Completing again is ignored; failing a completed task is ignored.
        assert!(!task.complete(json!(2), CompleteOpts::default()).unwrap());
        assert_eq!(task.result(), Some(json!(1)));
        assert!(!task.fail(&ConsumerError::task_failure("t", "late")).unwrap());
        assert_eq!(task.state(), TaskStateKind::Completed);
    }

    #[test]
    fn test_complete_rejected_task_is_finalised_error() {
        let task = Task::from_def(&noop_def("t"));
        task.reject("bad").unwrap();
        let error = task.complete(json!(1), CompleteOpts::default()).unwrap_err();
        assert!(error.is_finalised());
    }

    #[test]
    fn test_frozen_rejects_transitions() {
        let task = Task::from_def(&noop_def("t"));
        task.freeze();
        assert!(task.is_frozen());
        assert!(task.start().unwrap_err().is_finalised());
        assert!(task.complete(json!(1), CompleteOpts::default()).unwrap_err().is_finalised());
        assert!(task
            .timeout(&ConsumerError::timeout("late"), TimeoutOpts::default())
            .unwrap_err()
            .is_finalised());
    }

    #[test]
    fn test_freeze_propagates_to_subtree() {
        let def = noop_def("parent").with_sub_task_def(noop_def("child"));
        let task = Task::from_def(&def);
        task.freeze();
        assert!(task.sub_task("child").unwrap().is_frozen());
    }

    #[test]
    fn test_timeout_ignores_completed_without_override() {
        let task = Task::from_def(&noop_def("t"));
        task.start().unwrap();
        task.complete(json!(1), CompleteOpts::default()).unwrap();

        let timeout = ConsumerError::timeout("deadline");
        assert!(!task.timeout(&timeout, TimeoutOpts::default()).unwrap());
        assert_eq!(task.state(), TaskStateKind::Completed);

        let opts = TimeoutOpts { override_completed: true, ..TimeoutOpts::default() };
        assert!(task.timeout(&timeout, opts).unwrap());
        assert_eq!(task.state(), TaskStateKind::TimedOut);
    }

    #[test]
    fn test_timeout_reverses_in_progress_attempt() {
        let task = Task::from_def(&noop_def("t"));
        task.start().unwrap();
        assert_eq!(task.attempts(), 1);

        let timeout = ConsumerError::timeout_reversible("deadline");
        let opts = TimeoutOpts { reverse_attempt: true, ..TimeoutOpts::default() };
        assert!(task.timeout(&timeout, opts).unwrap());
        assert_eq!(task.state(), TaskStateKind::TimedOut);
        // The in-progress attempt was refunded; the total stays monotone.
        assert_eq!(task.attempts(), 0);
        assert_eq!(task.total_attempts(), 1);
    }

    #[test]
    fn test_timeout_ignores_unstarted_without_override() {
        let task = Task::from_def(&noop_def("t"));
        let timeout = ConsumerError::timeout("deadline");
        assert!(!task.timeout(&timeout, TimeoutOpts::default()).unwrap());
        assert_eq!(task.state(), TaskStateKind::Unstarted);
    }

    #[test]
    fn test_fully_finalised_requires_subtree() {
        let def = noop_def("parent").with_sub_task_def(noop_def("child"));
        let task = Task::from_def(&def);
        task.start().unwrap();
        task.complete(json!(null), CompleteOpts::default()).unwrap();
        assert!(task.is_finalised());
        assert!(!task.is_fully_finalised());

        task.sub_task("child").unwrap().discard().unwrap();
        assert!(task.is_fully_finalised());
    }

    #[test]
    fn test_master_transitions_mirror_onto_slaves() {
        let master = Task::from_def(&noop_def("all"));
        let slave_a = Task::from_def(&noop_def("all"));
        let slave_b = Task::from_def(&noop_def("all"));
        master.set_slaves(vec![slave_a.clone(), slave_b.clone()]);

        master.start().unwrap();
        assert_eq!(slave_a.state(), TaskStateKind::Started);
        assert_eq!(slave_b.state(), TaskStateKind::Started);

        master.complete(json!(7), CompleteOpts::default()).unwrap();
        assert_eq!(slave_a.state(), TaskStateKind::Completed);
        assert_eq!(slave_b.state(), TaskStateKind::Completed);
        assert_eq!(slave_a.result(), Some(json!(7)));
    }

    #[test]
    fn test_freeze_propagates_to_slaves() {
        let master = Task::from_def(&noop_def("all"));
        let slave = Task::from_def(&noop_def("all"));
        master.set_slaves(vec![slave.clone()]);
        master.freeze();
        assert!(slave.is_frozen());
    }

    #[test]
    fn test_discard_if_over_attempted() {
        let task = Task::from_def(&noop_def("t"));
        task.start().unwrap();
        task.fail(&ConsumerError::task_failure("t", "boom")).unwrap();
        // Below the cap: nothing discarded.
        assert_eq!(task.discard_if_over_attempted(2, true), 0);
        assert_eq!(task.state(), TaskStateKind::Failed);

        task.start().unwrap();
        task.fail(&ConsumerError::task_failure("t", "boom")).unwrap();
        assert_eq!(task.discard_if_over_attempted(2, true), 1);
        assert_eq!(task.state(), TaskStateKind::Discarded);
    }

    #[test]
    fn test_over_attempted_waits_for_children() {
        let def = noop_def("parent").with_sub_task_def(noop_def("child"));
        let task = Task::from_def(&def);
        task.start().unwrap();
        task.fail(&ConsumerError::task_failure("parent", "boom")).unwrap();

        // The unfinalised child blocks the discard.
        assert_eq!(task.discard_if_over_attempted(1, true), 0);
        task.sub_task("child").unwrap().discard().unwrap();
        assert_eq!(task.discard_if_over_attempted(1, true), 1);
    }

    #[test]
    fn test_revive_merges_snapshot() {
        let original = Task::from_def(&noop_def("t"));
        original.start().unwrap();
        original.fail(&ConsumerError::task_failure("t", "boom")).unwrap();
        let snapshot = original.to_snapshot();

        let revived = Task::revive(Some(&noop_def("t")), Some(&snapshot)).unwrap();
        assert_eq!(revived.state(), TaskStateKind::Failed);
        assert_eq!(revived.attempts(), 1);
        assert!(revived.last_error().is_some());
        assert!(!revived.is_unusable());
    }

    #[test]
    fn test_revive_orphan_snapshot_is_unusable() {
        let snapshot = TaskSnapshot {
            name: "legacy".to_string(),
            state: TaskStateSnapshot { kind: TaskStateKind::Unstarted, error: None, reason: None },
            attempts: 0,
            total_attempts: 0,
            began_at: None,
            ended_at: None,
            sub_tasks: vec![],
        };
        let revived = Task::revive(None, Some(&snapshot)).unwrap();
        assert!(revived.is_unusable());
    }

    #[test]
    fn test_abandon_dead_releases_orphans() {
        let def = noop_def("parent");
        let snapshot = TaskSnapshot {
            name: "parent".to_string(),
            state: TaskStateSnapshot { kind: TaskStateKind::Completed, error: None, reason: None },
            attempts: 1,
            total_attempts: 1,
            began_at: None,
            ended_at: None,
            sub_tasks: vec![TaskSnapshot {
                name: "legacy-child".to_string(),
                state: TaskStateSnapshot {
                    kind: TaskStateKind::Unstarted,
                    error: None,
                    reason: None,
                },
                attempts: 0,
                total_attempts: 0,
                began_at: None,
                ended_at: None,
                sub_tasks: vec![],
            }],
        };
        let task = Task::revive(Some(&def), Some(&snapshot)).unwrap();
        assert!(!task.is_fully_finalised());

        assert_eq!(task.abandon_dead("task def no longer exists"), 1);
        assert!(task.is_fully_finalised());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let def = noop_def("parent").with_sub_task_def(noop_def("child"));
        let task = Task::from_def(&def);
        task.start().unwrap();
        task.complete(json!("done"), CompleteOpts::default()).unwrap();

        let snapshot = task.to_snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: TaskSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snapshot, restored);
        assert_eq!(restored.state.kind, TaskStateKind::Completed);
        assert_eq!(restored.sub_tasks.len(), 1);
    }

    #[test]
    fn test_revive_task_map_modes() {
        let defs = vec![noop_def("a"), noop_def("b")];
        let mut prior = BTreeMap::new();
        let a = Task::from_def(&defs[0]);
        a.start().unwrap();
        prior.insert("a".to_string(), a.to_snapshot());
        prior.insert("legacy".to_string(), TaskSnapshot {
            name: "legacy".to_string(),
            state: TaskStateSnapshot { kind: TaskStateKind::Failed, error: None, reason: None },
            attempts: 1,
            total_attempts: 1,
            began_at: None,
            ended_at: None,
            sub_tasks: vec![],
        });

        let only_existing = revive_task_map(&defs, &prior, ReviveMode::OnlyExisting);
        assert!(only_existing.contains_key("a"));
        assert!(!only_existing.contains_key("b"));
        assert!(only_existing.contains_key("legacy"));
        assert!(only_existing["legacy"].is_unusable());

        let create_missing = revive_task_map(&defs, &prior, ReviveMode::CreateMissing);
        assert!(create_missing.contains_key("b"));
        assert_eq!(create_missing["b"].state(), TaskStateKind::Unstarted);
    }

    #[tokio::test]
    async fn test_execute_success_completes() {
        let def = TaskDef::new("t", Arc::new(|_| Box::pin(async { Ok(json!(42)) }))).unwrap();
        let task = Task::from_def(&def);
        let outcome = task.execute(message_input()).await;
        assert_eq!(outcome.kind, TaskOutcomeKind::Completed);
        assert_eq!(outcome.result, Some(json!(42)));
        assert_eq!(task.state(), TaskStateKind::Completed);
    }

    #[tokio::test]
    async fn test_execute_failure_counts_attempt() {
        let def = TaskDef::new(
            "t",
            Arc::new(|_| Box::pin(async { Err(ConsumerError::task_failure("t", "boom")) })),
        )
        .unwrap();
        let task = Task::from_def(&def);
        let outcome = task.execute(message_input()).await;
        assert_eq!(outcome.kind, TaskOutcomeKind::Failed);
        assert!(outcome.error.is_some());
        assert_eq!(task.state(), TaskStateKind::Failed);
        assert_eq!(task.attempts(), 1);
    }

    #[tokio::test]
    async fn test_execute_rejection_rejects_task() {
        let def = TaskDef::new(
            "t",
            Arc::new(|_| Box::pin(async { Err(ConsumerError::rejection("not ours")) })),
        )
        .unwrap();
        let task = Task::from_def(&def);
        let outcome = task.execute(message_input()).await;
        assert_eq!(outcome.kind, TaskOutcomeKind::Rejected);
        assert_eq!(task.state(), TaskStateKind::Rejected);
    }

    #[tokio::test]
    async fn test_execute_skips_fully_finalised() {
        let executed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = executed.clone();
        let def = TaskDef::new(
            "t",
            Arc::new(move |_| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Box::pin(async { Ok(Value::Null) })
            }),
        )
        .unwrap();
        let task = Task::from_def(&def);
        task.execute(message_input()).await;
        assert_eq!(executed.load(std::sync::atomic::Ordering::SeqCst), 1);

        // A second execution is skipped without re-running the executor.
        let outcome = task.execute(message_input()).await;
        assert_eq!(outcome.kind, TaskOutcomeKind::Finalised);
        assert_eq!(executed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_monotone_fully_finalised() {
        // Invariant: once fully finalised, a tree stays fully finalised.
        let def = noop_def("parent").with_sub_task_def(noop_def("child"));
        let task = Task::from_def(&def);
        task.start().unwrap();
        task.complete(Value::Null, CompleteOpts::default()).unwrap();
        task.sub_task("child").unwrap().reject("no").unwrap();
        assert!(task.is_fully_finalised());

        // Absorbing transitions cannot regress the tree.
        let _ = task.fail(&ConsumerError::task_failure("parent", "late"));
        let _ = task.sub_task("child").unwrap().start();
        assert!(task.is_fully_finalised());
    }
}
