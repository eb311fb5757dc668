//! Error types for the stream consumer core.
//!
//! This module defines the error hierarchy used across the batch lifecycle:
//! fatal configuration/infrastructure errors, transient store errors that
//! trigger redelivery, task-local failures, domain-level rejections,
//! unusable-input errors, deadline timeouts and the replay-triggering
//! incomplete-batch error.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The main error type for the stream consumer core.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Fatal error that requires operator attention (missing configuration,
    /// missing table, absent required callback). Disables the upstream
    /// event-source binding before surfacing.
    #[error("Fatal error: {message}")]
    Fatal {
        /// Error message describing what went wrong
        message: String,
    },

    /// Transient error that triggers redelivery of the same records.
    #[error("Transient error: {message}")]
    Transient {
        /// Error message describing what went wrong
        message: String,
        /// Optional underlying AWS error details
        aws_error: Option<AwsError>,
    },

    /// Store error from the checkpoint table or a dead-letter stream.
    ///
    /// Raised by the cloud facade clients; the checkpoint codec reclassifies
    /// these as [`ConsumerError::Transient`] or [`ConsumerError::Fatal`]
    /// according to the error code.
    #[error("Store error: {message}")]
    Store {
        /// Error message describing what went wrong
        message: String,
        /// Whether this error is retriable
        is_retriable: bool,
        /// Optional underlying AWS error details
        aws_error: Option<AwsError>,
    },

    /// A user-supplied execute callback failed. Counts an attempt on the
    /// owning task, but does not kill the phase.
    #[error("Task '{task_name}' failed: {message}")]
    TaskFailure {
        /// Error message from the user callback
        message: String,
        /// The name of the failed task
        task_name: String,
    },

    /// Domain-level rejection from a user callback. Terminal for the
    /// message, which is routed to the dead-message stream.
    #[error("Rejected: {reason}")]
    Rejection {
        /// The reason the message was rejected
        reason: String,
    },

    /// The record could not be decoded into a message at all. Terminal for
    /// the record, which is routed to the dead-record stream.
    #[error("Unusable record: {reason}")]
    Unusable {
        /// The reason the record is unusable
        reason: String,
    },

    /// A phase deadline fired. When `reversible` is set, the in-progress
    /// attempt of every timed-out task is reversed so retry budget is kept.
    #[error("Timeout: {message}")]
    Timeout {
        /// Error message describing the timeout
        message: String,
        /// Whether the in-progress attempt is reversed
        reversible: bool,
    },

    /// A state transition was attempted on a task already in a terminal
    /// state without an explicit override. Promoted to fatal by the
    /// orchestrator's replay policy.
    #[error("Task '{task_name}' is already finalised in state {state_name}")]
    Finalised {
        /// The name of the task
        task_name: String,
        /// The terminal state the task is in
        state_name: String,
    },

    /// A state transition was attempted on a frozen task.
    #[error("Task '{task_name}' is frozen and cannot transition")]
    Frozen {
        /// The name of the frozen task
        task_name: String,
    },

    /// Invalid configuration or arguments.
    #[error("Validation error: {message}")]
    Validation {
        /// Error message describing the validation failure
        message: String,
    },

    /// Serialization/deserialization failure.
    #[error("Serialization error: {message}")]
    SerDes {
        /// Error message describing the serialization failure
        message: String,
    },

    /// The batch is not fully finalised after the finalise phase. Re-raised
    /// so the host redelivers the same records.
    #[error("Batch incomplete: {message}")]
    Incomplete {
        /// Error message describing what is still incomplete
        message: String,
    },
}

impl ConsumerError {
    /// Creates a new Fatal error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal { message: message.into() }
    }

    /// Creates a new Transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient { message: message.into(), aws_error: None }
    }

    /// Creates a new retriable Store error.
    pub fn store_retriable(message: impl Into<String>, aws_error: Option<AwsError>) -> Self {
        Self::Store { message: message.into(), is_retriable: true, aws_error }
    }

    /// Creates a new non-retriable Store error.
    pub fn store_non_retriable(message: impl Into<String>, aws_error: Option<AwsError>) -> Self {
        Self::Store { message: message.into(), is_retriable: false, aws_error }
    }

    /// Creates a new TaskFailure error.
    pub fn task_failure(task_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TaskFailure { message: message.into(), task_name: task_name.into() }
    }

    /// Creates a new Rejection error.
    pub fn rejection(reason: impl Into<String>) -> Self {
        Self::Rejection { reason: reason.into() }
    }

    /// Creates a new Unusable error.
    pub fn unusable(reason: impl Into<String>) -> Self {
        Self::Unusable { reason: reason.into() }
    }

    /// Creates a new non-reversible Timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout { message: message.into(), reversible: false }
    }

    /// Creates a new reversible Timeout error (the partial attempt does not
    /// consume retry budget).
    pub fn timeout_reversible(message: impl Into<String>) -> Self {
        Self::Timeout { message: message.into(), reversible: true }
    }

    /// Creates a new Validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Creates a new SerDes error.
    pub fn serdes(message: impl Into<String>) -> Self {
        Self::SerDes { message: message.into() }
    }

    /// Creates a new Incomplete error.
    pub fn incomplete(message: impl Into<String>) -> Self {
        Self::Incomplete { message: message.into() }
    }

    /// Returns true if this is a Fatal error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    /// Returns true if this error should trigger redelivery without
    /// consuming retry budget (transient store/system errors).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Store { is_retriable: true, .. })
    }

    /// Returns true if this is a Timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if this is a reversible Timeout error.
    pub fn is_reversible_timeout(&self) -> bool {
        matches!(self, Self::Timeout { reversible: true, .. })
    }

    /// Returns true if this is a domain-level Rejection.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejection { .. })
    }

    /// Returns true if this is an Unusable-record error.
    pub fn is_unusable(&self) -> bool {
        matches!(self, Self::Unusable { .. })
    }

    /// Returns true if this is a Finalised or Frozen state-machine error.
    pub fn is_finalised(&self) -> bool {
        matches!(self, Self::Finalised { .. } | Self::Frozen { .. })
    }

    /// Returns the AWS error code if this error carries one.
    pub fn aws_error_code(&self) -> Option<&str> {
        match self {
            Self::Transient { aws_error: Some(e), .. } | Self::Store { aws_error: Some(e), .. } => {
                Some(e.code.as_str())
            }
            _ => None,
        }
    }

    /// Returns true if this is a conditional-check failure from the
    /// checkpoint store (the insert-vs-update mode must be flipped).
    pub fn is_conditional_check_failed(&self) -> bool {
        self.aws_error_code()
            .map(|code| code.contains("ConditionalCheckFailed"))
            .unwrap_or(false)
    }
}

/// AWS error details for store/stream failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsError {
    /// The AWS error code
    pub code: String,
    /// The AWS error message
    pub message: String,
    /// The request ID if available
    pub request_id: Option<String>,
}

impl AwsError {
    /// Creates a new AwsError.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into(), request_id: None }
    }
}

/// Serializable error projection stored on tasks and in checkpoint items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// The error type/name
    #[serde(rename = "Name")]
    pub name: String,
    /// The error message
    #[serde(rename = "Message")]
    pub message: String,
}

impl ErrorInfo {
    /// Creates a new ErrorInfo.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self { name: name.into(), message: message.into() }
    }
}

impl From<&ConsumerError> for ErrorInfo {
    fn from(error: &ConsumerError) -> Self {
        let name = match error {
            ConsumerError::Fatal { .. } => "FatalError",
            ConsumerError::Transient { .. } => "TransientError",
            ConsumerError::Store { is_retriable: true, .. } => "RetriableStoreError",
            ConsumerError::Store { .. } => "StoreError",
            ConsumerError::TaskFailure { .. } => "TaskFailure",
            ConsumerError::Rejection { .. } => "RejectedError",
            ConsumerError::Unusable { .. } => "UnusableError",
            ConsumerError::Timeout { .. } => "TimeoutError",
            ConsumerError::Finalised { .. } => "FinalisedError",
            ConsumerError::Frozen { .. } => "FrozenError",
            ConsumerError::Validation { .. } => "ValidationError",
            ConsumerError::SerDes { .. } => "SerDesError",
            ConsumerError::Incomplete { .. } => "IncompleteError",
        };
        ErrorInfo::new(name, error.to_string())
    }
}

impl From<serde_json::Error> for ConsumerError {
    fn from(error: serde_json::Error) -> Self {
        Self::SerDes { message: error.to_string() }
    }
}
