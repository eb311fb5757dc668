//! Task templates and executor types.
//!
//! A [`TaskDef`] is a small descriptor record: a name, an optional async
//! execute function and a list of sub-task templates. The same template
//! machinery drives the per-message, per-record, batch-wide and phase task
//! trees; a template without an executor is a *managed* task whose
//! transitions are driven directly by the orchestrator.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::batch::state::BatchKey;
use crate::discard::{RejectedMessageEnvelope, UnusableRecordEnvelope};
use crate::error::ConsumerError;

/// The async execute function of a task template.
pub type ExecuteFn =
    Arc<dyn Fn(TaskInput) -> BoxFuture<'static, Result<Value, ConsumerError>> + Send + Sync>;

/// The input handed to a task's execute function.
///
/// Executors receive cloned data rather than references into the batch, so
/// they can run concurrently while the batch itself stays on one worker.
#[derive(Debug, Clone)]
pub enum TaskInput {
    /// A process-one task executing against a single message
    Message(MessageScope),
    /// A process-all task executing against the batch's incomplete messages
    Batch(BatchScope),
    /// A discard task executing against an unusable record
    UnusableRecord(UnusableRecordEnvelope),
    /// A discard task executing against a rejected message
    RejectedMessage(RejectedMessageEnvelope),
}

/// The scope of a process-one execution.
#[derive(Debug, Clone)]
pub struct MessageScope {
    /// The message being processed
    pub message: Value,
    /// The record the message was extracted from
    pub record: Option<Value>,
    /// The user record, for de-aggregated records
    pub user_record: Option<Value>,
    /// The owning batch's key
    pub batch_key: BatchKey,
    /// Short description of the message for log lines
    pub description: String,
}

/// The scope of a process-all execution: the batch's current view of
/// incomplete messages.
#[derive(Debug, Clone)]
pub struct BatchScope {
    /// The incomplete messages at execution time
    pub messages: Vec<Value>,
    /// The owning batch's key
    pub batch_key: BatchKey,
}

/// A task template: name, optional execute function and sub-task templates.
#[derive(Clone)]
pub struct TaskDef {
    name: String,
    execute: Option<ExecuteFn>,
    sub_task_defs: Vec<TaskDef>,
}

impl std::fmt::Debug for TaskDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDef")
            .field("name", &self.name)
            .field("execute", &self.execute.is_some())
            .field("sub_task_defs", &self.sub_task_defs)
            .finish()
    }
}

impl TaskDef {
    /// Creates a new executable task template.
    pub fn new(name: impl Into<String>, execute: ExecuteFn) -> Result<Self, ConsumerError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConsumerError::validation("Task definition name must not be blank"));
        }
        Ok(Self { name, execute: Some(execute), sub_task_defs: Vec::new() })
    }

    /// Creates a managed task template with no executor. Its transitions
    /// are driven directly by the orchestrator.
    pub fn managed(name: impl Into<String>) -> Self {
        Self { name: name.into(), execute: None, sub_task_defs: Vec::new() }
    }

    /// Adds a sub-task template.
    pub fn with_sub_task_def(mut self, def: TaskDef) -> Self {
        self.sub_task_defs.push(def);
        self
    }

    /// Adds several sub-task templates.
    pub fn with_sub_task_defs(mut self, defs: impl IntoIterator<Item = TaskDef>) -> Self {
        self.sub_task_defs.extend(defs);
        self
    }

    /// Returns the template's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the template's execute function, if any.
    pub fn execute(&self) -> Option<&ExecuteFn> {
        self.execute.as_ref()
    }

    /// Returns the sub-task templates.
    pub fn sub_task_defs(&self) -> &[TaskDef] {
        &self.sub_task_defs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_execute() -> ExecuteFn {
        Arc::new(|_input| Box::pin(async { Ok(Value::Null) }))
    }

    #[test]
    fn test_new_rejects_blank_name() {
        assert!(TaskDef::new("  ", noop_execute()).is_err());
        assert!(TaskDef::new("processOne", noop_execute()).is_ok());
    }

    #[test]
    fn test_managed_def_has_no_executor() {
        let def = TaskDef::managed("processing");
        assert!(def.execute().is_none());
        assert_eq!(def.name(), "processing");
    }

    #[test]
    fn test_sub_task_defs() {
        let def = TaskDef::managed("parent")
            .with_sub_task_def(TaskDef::managed("child-a"))
            .with_sub_task_def(TaskDef::managed("child-b"));
        assert_eq!(def.sub_task_defs().len(), 2);
        assert_eq!(def.sub_task_defs()[0].name(), "child-a");
    }

    #[test]
    fn test_debug_elides_executor() {
        let def = TaskDef::new("t", noop_execute()).unwrap();
        let formatted = format!("{def:?}");
        assert!(formatted.contains("\"t\""));
        assert!(formatted.contains("execute: true"));
    }
}
