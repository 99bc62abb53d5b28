//! The error taxonomy shared across the acquisition core.
//!
//! Layers return `anyhow::Result` and attach a [`CoreError`] as the root
//! cause whenever the failure has a defined policy (not-found, forbidden,
//! bad input, ...). The HTTP layer recovers the variant with
//! `err.downcast_ref::<CoreError>()` to pick a status code; everything else
//! maps to 500.

use thiserror::Error;

/// Classified failures with a defined propagation policy.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Entity lookup came up empty. Maps to HTTP 404.
    #[error("not found: {0}")]
    NotFound(String),

    /// Missing or invalid credentials. Maps to HTTP 401.
    #[error("unauthorized")]
    Unauthorized,

    /// The actor may not mutate this resource. Maps to HTTP 403.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Request violated a schema or enum boundary. Maps to HTTP 400.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A uniqueness or integrity rule was violated. Maps to HTTP 409.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The storage backend is unreachable. Maps to HTTP 503.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The operation was cancelled; terminal, never retried.
    #[error("cancelled")]
    Cancelled,
}

impl CoreError {
    /// The HTTP status code this failure maps to at the API boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            CoreError::NotFound(_) => 404,
            CoreError::Unauthorized => 401,
            CoreError::Forbidden(_) => 403,
            CoreError::InvalidInput(_) => 400,
            CoreError::Conflict(_) => 409,
            CoreError::StorageUnavailable(_) => 503,
            CoreError::Cancelled => 499,
        }
    }

    /// Stable machine-readable code for error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NotFound(_) => "not_found",
            CoreError::Unauthorized => "unauthorized",
            CoreError::Forbidden(_) => "forbidden",
            CoreError::InvalidInput(_) => "invalid_input",
            CoreError::Conflict(_) => "conflict",
            CoreError::StorageUnavailable(_) => "storage_unavailable",
            CoreError::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(CoreError::NotFound("x".into()).http_status(), 404);
        assert_eq!(CoreError::Unauthorized.http_status(), 401);
        assert_eq!(CoreError::Forbidden("x".into()).http_status(), 403);
        assert_eq!(CoreError::InvalidInput("x".into()).http_status(), 400);
        assert_eq!(CoreError::Conflict("x".into()).http_status(), 409);
        assert_eq!(CoreError::StorageUnavailable("x".into()).http_status(), 503);
    }

    #[test]
    fn recoverable_through_anyhow() {
        let err: anyhow::Error = CoreError::NotFound("component kernel".into()).into();
        let core = err.downcast_ref::<CoreError>().expect("downcast");
        assert_eq!(core.http_status(), 404);
        assert_eq!(core.code(), "not_found");
    }

    #[test]
    fn display_carries_context() {
        let err = CoreError::Forbidden("system component".into());
        assert_eq!(err.to_string(), "forbidden: system component");
    }
}
