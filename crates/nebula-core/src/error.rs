//! Sync error handling
//!
//! Provides typed errors for engine actions with a classification of backend
//! failures and the affordance the view should offer for each.

use thiserror::Error;

/// Errors surfaced by engine actions and provider calls
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The action needs a signed-in user
    #[error("Sign in required: {0}")]
    AuthRequired(String),

    /// The referenced row does not exist (usually a race with a delete)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unique constraint violation, e.g. liking a post twice
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Transient I/O failure talking to the backend
    #[error("Network error: {0}")]
    Network(String),

    /// Row-level security or role check rejected the request
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A backend row could not be mapped into a client entity
    #[error("Malformed {entity} row: {details}")]
    Malformed {
        entity: &'static str,
        details: String,
    },

    /// Backend error that does not fit a more specific variant
    #[error("Backend error ({code}): {message}")]
    Backend { code: String, message: String },

    /// Local persistence failed
    #[error("Storage error: {0}")]
    Storage(String),
}

/// What the view layer should offer the user for an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    /// Show a retry affordance
    Retry,
    /// Prompt for sign-in
    SignIn,
    /// Drop the stale entry silently; nothing is shown
    RemoveStale,
    /// Show the message and let the user dismiss it
    Dismiss,
}

impl SyncError {
    /// Create a malformed-row error
    pub fn malformed(entity: &'static str, details: impl Into<String>) -> Self {
        SyncError::Malformed {
            entity,
            details: details.into(),
        }
    }

    /// Classify a backend error code and message
    ///
    /// Postgres SQLSTATE codes and PostgREST codes are mapped onto the
    /// client taxonomy. Anything unrecognized stays a `Backend` error.
    pub fn from_backend(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            "23505" => SyncError::Conflict(message),
            "42501" => SyncError::PermissionDenied(message),
            // Foreign key violation: the parent row was deleted
            "23503" => SyncError::NotFound(message),
            "PGRST116" => SyncError::NotFound(message),
            "PGRST301" | "PGRST302" => SyncError::AuthRequired(message),
            _ if message.contains("JWT") => SyncError::AuthRequired(message),
            _ => SyncError::Backend {
                code: code.to_string(),
                message,
            },
        }
    }

    /// Classify an HTTP status that carried no structured body
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => SyncError::AuthRequired(message),
            403 => SyncError::PermissionDenied(message),
            404 | 406 => SyncError::NotFound(message),
            409 => SyncError::Conflict(message),
            408 | 429 | 500..=599 => SyncError::Network(message),
            _ => SyncError::Backend {
                code: status.to_string(),
                message,
            },
        }
    }

    /// The affordance the view should show for this error
    pub fn user_action(&self) -> UserAction {
        match self {
            SyncError::Network(_) | SyncError::Conflict(_) => UserAction::Retry,
            SyncError::AuthRequired(_) => UserAction::SignIn,
            SyncError::NotFound(_) => UserAction::RemoveStale,
            _ => UserAction::Dismiss,
        }
    }

    /// Check if retrying the same action may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Conflict(_))
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            SyncError::Network(_) => Some("Check your connection and try again."),
            SyncError::AuthRequired(_) => Some("Your session has ended. Sign in again."),
            SyncError::Conflict(_) => Some("This item already exists. Refresh and try again."),
            SyncError::PermissionDenied(_) => {
                Some("You do not have permission to perform this action.")
            }
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => SyncError::from_status(status.as_u16(), error.to_string()),
            None => SyncError::Network(error.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        SyncError::Malformed {
            entity: "json",
            details: error.to_string(),
        }
    }
}

/// Result type for engine actions and provider calls
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_code_classification() {
        assert!(matches!(
            SyncError::from_backend("23505", "duplicate key"),
            SyncError::Conflict(_)
        ));
        assert!(matches!(
            SyncError::from_backend("42501", "rls"),
            SyncError::PermissionDenied(_)
        ));
        assert!(matches!(
            SyncError::from_backend(
                "23503",
                "insert or update on table \"likes\" violates foreign key constraint \"likes_post_id_fkey\""
            ),
            SyncError::NotFound(_)
        ));
        assert!(matches!(
            SyncError::from_backend("PGRST116", "no rows"),
            SyncError::NotFound(_)
        ));
        assert!(matches!(
            SyncError::from_backend("", "JWT expired"),
            SyncError::AuthRequired(_)
        ));
        assert!(matches!(
            SyncError::from_backend("22P02", "invalid input"),
            SyncError::Backend { .. }
        ));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            SyncError::from_status(401, "unauthorized"),
            SyncError::AuthRequired(_)
        ));
        assert!(matches!(
            SyncError::from_status(503, "unavailable"),
            SyncError::Network(_)
        ));
        assert!(matches!(
            SyncError::from_status(409, "conflict"),
            SyncError::Conflict(_)
        ));
    }

    #[test]
    fn test_user_action() {
        assert_eq!(
            SyncError::Network("down".into()).user_action(),
            UserAction::Retry
        );
        assert_eq!(
            SyncError::Conflict("dup".into()).user_action(),
            UserAction::Retry
        );
        assert_eq!(
            SyncError::AuthRequired("login".into()).user_action(),
            UserAction::SignIn
        );
        assert_eq!(
            SyncError::NotFound("gone".into()).user_action(),
            UserAction::RemoveStale
        );
        assert_eq!(
            SyncError::malformed("post", "missing id").user_action(),
            UserAction::Dismiss
        );
    }

    #[test]
    fn test_recoverable() {
        assert!(SyncError::Network("timeout".into()).is_recoverable());
        assert!(!SyncError::PermissionDenied("no".into()).is_recoverable());
        assert!(SyncError::Network("timeout".into())
            .recovery_suggestion()
            .is_some());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::malformed("post", "missing created_at");
        let msg = err.to_string();
        assert!(msg.contains("Malformed post row"));
        assert!(msg.contains("created_at"));
    }
}
