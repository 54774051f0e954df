use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use uuid::Uuid;

/// User record as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String, // bcrypt/argon2 hash, not exposed in JSON
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(flatten)]
    pub profile: Map<String, Value>, // caller-supplied extra fields
}

/// Everything the store needs to persist a new user; id and timestamp are
/// assigned by the store.
#[derive(Debug, Clone)]
pub struct NewUserRecord {
    pub email: String,
    pub password_hash: String,
    pub profile: Map<String, Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate value for unique field `{field}`")]
    DuplicateKey { field: &'static str },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}
