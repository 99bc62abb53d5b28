//! The JSON contract exported to the HTTP layer.
//!
//! Routing and authentication live outside the core; what the core owns is
//! the shape of list responses (`{count, items}`), the shape of error
//! responses (`{error, code, message}`), and the mapping from failures to
//! HTTP status codes. The HTTP layer calls [`error_response`] with whatever
//! `anyhow::Error` bubbled up.

use serde::Serialize;

use distsmith_types::CoreError;

/// List envelope: `{"count": 2, "items": [...]}`.
#[derive(Debug, Serialize)]
pub struct ListEnvelope<T: Serialize> {
    pub count: usize,
    pub items: Vec<T>,
}

impl<T: Serialize> ListEnvelope<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            count: items.len(),
            items,
        }
    }
}

impl<T: Serialize> From<Vec<T>> for ListEnvelope<T> {
    fn from(items: Vec<T>) -> Self {
        Self::new(items)
    }
}

/// Error envelope: `{"error": "not_found", "code": 404, "message": "..."}`.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: String,
    pub code: u16,
    pub message: String,
}

/// Map a core failure to `(http_status, envelope)`. Classified failures
/// carry their own status; anything else is a 500 whose message is the full
/// context chain.
pub fn error_response(err: &anyhow::Error) -> (u16, ErrorEnvelope) {
    match err.downcast_ref::<CoreError>() {
        Some(core) => (
            core.http_status(),
            ErrorEnvelope {
                error: core.code().to_string(),
                code: core.http_status(),
                message: core.to_string(),
            },
        ),
        None => (
            500,
            ErrorEnvelope {
                error: "internal".to_string(),
                code: 500,
                message: format!("{:#}", err),
            },
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_envelope_counts_items() {
        let envelope = ListEnvelope::from(vec!["a", "b", "c"]);
        let json = serde_json::to_string(&envelope).expect("serialize");
        assert_eq!(json, r#"{"count":3,"items":["a","b","c"]}"#);
    }

    #[test]
    fn classified_errors_keep_their_status() {
        let err: anyhow::Error = CoreError::NotFound("component x".into()).into();
        let (status, envelope) = error_response(&err);
        assert_eq!(status, 404);
        assert_eq!(envelope.error, "not_found");
        assert_eq!(envelope.message, "not found: component x");
    }

    #[test]
    fn classified_errors_survive_context_wrapping() {
        let err = anyhow::Error::from(CoreError::Forbidden("system source".into()))
            .context("while deleting source");
        let (status, envelope) = error_response(&err);
        assert_eq!(status, 403);
        assert_eq!(envelope.error, "forbidden");
    }

    #[test]
    fn unclassified_errors_are_500() {
        let err = anyhow::anyhow!("disk exploded");
        let (status, envelope) = error_response(&err);
        assert_eq!(status, 500);
        assert_eq!(envelope.error, "internal");
        assert!(envelope.message.contains("disk exploded"));
    }
}
