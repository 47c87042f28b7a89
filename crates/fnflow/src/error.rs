//! The crate-wide error taxonomy. Narrower, module-local error enums convert
//! into [`EngineError`] via `From`, so callers that don't care about the
//! detail of e.g. a store failure can propagate with `?` all the way up.

use thiserror::Error;

use crate::eventlog::store::StoreError;
use crate::expr::ExprError;
use crate::runtime::RuntimeError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("expression evaluation error: {0}")]
    EvalError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => EngineError::NotFound(err.to_string()),
            StoreError::ConcurrencyConflict { .. } => EngineError::Conflict(err.to_string()),
            StoreError::Unavailable(_) => EngineError::Unavailable(err.to_string()),
            StoreError::Serialization(_) => EngineError::Internal(err.to_string()),
        }
    }
}

impl From<ExprError> for EngineError {
    fn from(err: ExprError) -> Self {
        match err {
            ExprError::Timeout { .. } => EngineError::Timeout(err.to_string()),
            ExprError::Eval(_) | ExprError::UnknownReference(_) => EngineError::EvalError(err.to_string()),
        }
    }
}

impl From<RuntimeError> for EngineError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::UnknownFunction(_) => EngineError::NotFound(err.to_string()),
            RuntimeError::Unavailable(_) => EngineError::Unavailable(err.to_string()),
            RuntimeError::Invocation(_) => EngineError::Internal(err.to_string()),
        }
    }
}

impl From<crate::model::aggregate::ApplyError> for EngineError {
    fn from(err: crate::model::aggregate::ApplyError) -> Self {
        EngineError::Internal(err.to_string())
    }
}

impl From<crate::model::spec::SpecValidationError> for EngineError {
    fn from(err: crate::model::spec::SpecValidationError) -> Self {
        EngineError::InvalidArgument(err.to_string())
    }
}
