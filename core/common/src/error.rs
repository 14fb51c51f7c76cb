//! Common error types for the gearshed backend layer.

use std::fmt;
use thiserror::Error;

use crate::types::ExecutionContext;

/// Machine-readable codes attached to authentication failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthErrorCode {
    InvalidEmail,
    WeakPassword,
    EmailAlreadyInUse,
    InvalidCredential,
    UserNotFound,
    NoCurrentUser,
    InvalidActionCode,
    InvalidIdToken,
    IdTokenExpired,
    IdTokenRevoked,
    InvalidSessionCookieDuration,
    SessionCookieExpired,
    SessionCookieRevoked,
    InvalidSessionCookie,
}

impl AuthErrorCode {
    /// The wire form of the code, e.g. `auth/invalid-email`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidEmail => "auth/invalid-email",
            Self::WeakPassword => "auth/weak-password",
            Self::EmailAlreadyInUse => "auth/email-already-in-use",
            Self::InvalidCredential => "auth/invalid-credential",
            Self::UserNotFound => "auth/user-not-found",
            Self::NoCurrentUser => "auth/no-current-user",
            Self::InvalidActionCode => "auth/invalid-action-code",
            Self::InvalidIdToken => "auth/argument-error",
            Self::IdTokenExpired => "auth/id-token-expired",
            Self::IdTokenRevoked => "auth/id-token-revoked",
            Self::InvalidSessionCookieDuration => "auth/invalid-session-cookie-duration",
            Self::SessionCookieExpired => "auth/session-cookie-expired",
            Self::SessionCookieRevoked => "auth/session-cookie-revoked",
            Self::InvalidSessionCookie => "auth/invalid-session-cookie",
        }
    }
}

impl fmt::Display for AuthErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for backend layer operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Backend configuration is missing, invalid or names an unknown provider.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A method was invoked from the wrong execution context.
    #[error("{operation} is not available in the {context} context")]
    ContextViolation {
        operation: &'static str,
        context: ExecutionContext,
    },

    /// A provider accessor was used before `initialize()` completed.
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// The active backend does not declare the requested capability.
    #[error("Unsupported by backend: {0}")]
    Unsupported(String),

    /// Authentication failed.
    #[error("{message} ({code})")]
    Auth {
        code: AuthErrorCode,
        message: String,
    },

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Operation not permitted for the caller.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A transaction precondition no longer holds.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The underlying backend call failed.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build an authentication error with its code.
    pub fn auth(code: AuthErrorCode, message: impl Into<String>) -> Self {
        Self::Auth {
            code,
            message: message.into(),
        }
    }

    /// Build a context violation for `operation` invoked from `context`.
    pub fn context_violation(operation: &'static str, context: ExecutionContext) -> Self {
        Self::ContextViolation { operation, context }
    }

    /// The auth code, when this is an authentication error.
    pub fn auth_code(&self) -> Option<AuthErrorCode> {
        match self {
            Self::Auth { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether this error is a context violation.
    pub fn is_context_violation(&self) -> bool {
        matches!(self, Self::ContextViolation { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_violation_message() {
        let err = Error::context_violation("verify_id_token", ExecutionContext::Client);
        assert_eq!(
            err.to_string(),
            "verify_id_token is not available in the client context"
        );
        assert!(err.is_context_violation());
    }

    #[test]
    fn test_auth_error_carries_code() {
        let err = Error::auth(AuthErrorCode::WeakPassword, "Password is too short");
        assert_eq!(err.auth_code(), Some(AuthErrorCode::WeakPassword));
        assert_eq!(err.to_string(), "Password is too short (auth/weak-password)");
    }
}
