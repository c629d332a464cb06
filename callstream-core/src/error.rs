//! Core error taxonomy.
//!
//! `InvalidInput` surfaces to external callers as a 422. Everything else is
//! internal: logged with `call_id` context and, when it causes a terminal
//! transition, reflected on the event stream as a sanitized `ai_failed`
//! reason. Duplicate packets are not errors at all; they are an insert
//! signal handled inline.

use thiserror::Error;

use crate::ai::AiError;
use crate::call::InvalidTransition;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum CoreError {
    /// Rejected before any work happened. The message is safe to echo.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A lifecycle transition the graph forbids. Programming error.
    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    /// Terminal outcome of the analyzer retry policy.
    #[error(transparent)]
    Ai(#[from] AiError),

    /// Store failure that survived the transient-retry bound.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CoreError {
    /// Whether this error may be shown verbatim to an external caller.
    pub fn is_caller_safe(&self) -> bool {
        matches!(self, CoreError::InvalidInput(_))
    }
}
