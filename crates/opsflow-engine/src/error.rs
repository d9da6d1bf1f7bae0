//! Engine error taxonomy.
//!
//! Node-local failures never escape the workflow: they become node statuses
//! and drive the graph. The variants here cover everything that crosses the
//! engine's own boundaries.

use opsflow_storage::StoreError;

use crate::invoker::InvokeError;
use crate::resolver::ResolveError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed request or impossible state transition, e.g. retry on a
    /// node that is not faulted. Surfaces as 4xx, never retried.
    #[error("validation failure: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Transient repository failure that exhausted its retry budget.
    #[error("repository failure: {0}")]
    Repository(String),

    #[error("plugin failure: {0}")]
    Plugin(String),

    /// Assertion failure in the interpreter; the workflow is marked
    /// `problem` and needs human intervention.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Validation(msg) => Self::Validation(msg),
            StoreError::DefinitionNotFound(_)
            | StoreError::InstanceNotFound(_)
            | StoreError::WorkflowNotFound(_)
            | StoreError::NodeNotFound(_)
            | StoreError::RequestNotFound(_) => Self::NotFound(e.to_string()),
            StoreError::Database(msg) | StoreError::Serialization(msg) => Self::Repository(msg),
        }
    }
}

impl From<ResolveError> for EngineError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::BadExpression(msg) => Self::Validation(msg),
            ResolveError::RootMatch { .. } | ResolveError::EmptyHops(_) => {
                Self::Validation(e.to_string())
            }
            ResolveError::Upstream(msg) => Self::Plugin(msg),
        }
    }
}

impl From<InvokeError> for EngineError {
    fn from(e: InvokeError) -> Self {
        match e {
            InvokeError::MissingParam(_) => Self::Validation(e.to_string()),
            _ => Self::Plugin(e.to_string()),
        }
    }
}
