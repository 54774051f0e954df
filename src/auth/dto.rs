use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::repo_types::User;

/// Request body for enrollment and registration. Any field other than
/// `email` and `password` is kept as a profile field.
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(flatten)]
    pub profile: Map<String, Value>,
}

#[cfg(test)]
impl NewUser {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            profile: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.profile.insert(key.into(), value.into());
        self
    }
}

/// Request body for login.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Response returned after login or register.
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub user: PublicUser,
    pub token: String,
}

/// User record without the password hash.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublicUser {
    pub id: Uuid,
    pub email: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(flatten)]
    pub profile: Map<String, Value>,
}

impl From<User> for PublicUser {
    fn from(user: User) -> Self {
        let User {
            id,
            email,
            password_hash: _,
            created_at,
            profile,
        } = user;
        Self {
            id,
            email,
            created_at,
            profile,
        }
    }
}
