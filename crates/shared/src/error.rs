use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::CallState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    Internal,
}

/// Wire-level error shape returned by the HTTP surface and carried inside
/// `ServerEvent::Error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Typed failure taxonomy of the coordination core.
///
/// Delivery to an unbound identity is deliberately absent: a missing channel
/// is a silent no-op for callers, only logged by the registry.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("caller is not a participant of thread {0}")]
    ThreadAccessDenied(String),

    #[error("message not found or not addressed to caller")]
    MessageNotFound,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation '{operation}' not permitted from call state {state}")]
    InvalidCallState {
        operation: &'static str,
        state: CallState,
    },

    #[error("storage failure: {0}")]
    Storage(#[source] anyhow::Error),
}

impl From<CoreError> for ApiError {
    fn from(value: CoreError) -> Self {
        let code = match &value {
            CoreError::Authentication(_) => ErrorCode::Unauthorized,
            CoreError::ThreadAccessDenied(_) => ErrorCode::Forbidden,
            CoreError::MessageNotFound => ErrorCode::NotFound,
            CoreError::InvalidArgument(_) | CoreError::InvalidCallState { .. } => {
                ErrorCode::Validation
            }
            CoreError::Storage(_) => ErrorCode::Internal,
        };
        ApiError::new(code, value.to_string())
    }
}
