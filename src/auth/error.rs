use std::fmt;

use axum::http::StatusCode;
use uuid::Uuid;

/// Which half of a credential pair failed to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialFault {
    Email,
    Password,
}

impl fmt::Display for CredentialFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialFault::Email => f.write_str("email"),
            CredentialFault::Password => f.write_str("password"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("password is required")]
    EmptyPassword,
    #[error("{0} already exists!")]
    DuplicateEmail(String),
    #[error("Not valid credentials - {0}")]
    InvalidCredentials(CredentialFault),
    #[error("user {0} not found")]
    NotFound(Uuid),
    #[error("storage failure")]
    StorageFailure,
    #[error("internal error")]
    Internal,
}

impl AuthError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::EmptyPassword | AuthError::DuplicateEmail(_) => StatusCode::BAD_REQUEST,
            AuthError::InvalidCredentials(_) => StatusCode::UNAUTHORIZED,
            AuthError::NotFound(_) => StatusCode::NOT_FOUND,
            AuthError::StorageFailure | AuthError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand to a client. Server-side failures collapse to
    /// one opaque string; credential faults are only named when `disclose_fault`.
    pub fn client_message(&self, disclose_fault: bool) -> String {
        match self {
            AuthError::InvalidCredentials(_) if !disclose_fault => "Not valid credentials".into(),
            AuthError::StorageFailure | AuthError::Internal => "Something went wrong".into(),
            other => other.to_string(),
        }
    }
}
