use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{types::Json, FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::repo_types::{NewUserRecord, StoreError, User};

/// Durable user storage. Implementations must enforce email uniqueness
/// themselves and report a violation as `StoreError::DuplicateKey`.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn insert(&self, record: NewUserRecord) -> Result<User, StoreError>;
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;
    async fn find_all(&self) -> Result<Vec<User>, StoreError>;
}

#[derive(FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    password_hash: String,
    profile: Json<Map<String, Value>>,
    created_at: OffsetDateTime,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            email: row.email,
            password_hash: row.password_hash,
            created_at: row.created_at,
            profile: row.profile.0,
        }
    }
}

/// Postgres-backed store; uniqueness comes from the `users.email` constraint.
#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn insert(&self, record: NewUserRecord) -> Result<User, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            INSERT INTO users (email, password_hash, profile)
            VALUES ($1, $2, $3)
            RETURNING id, email, password_hash, profile, created_at
            "#,
        )
        .bind(&record.email)
        .bind(&record.password_hash)
        .bind(Json(&record.profile))
        .fetch_one(&self.db)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                StoreError::DuplicateKey { field: "email" }
            }
            other => StoreError::Backend(anyhow::Error::new(other).context("insert user")),
        })?;
        Ok(row.into())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, email, password_hash, profile, created_at
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.db)
        .await
        .context("find user by email")?;
        Ok(row.map(User::from))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, email, password_hash, profile, created_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .context("find user by id")?;
        Ok(row.map(User::from))
    }

    async fn find_all(&self) -> Result<Vec<User>, StoreError> {
        let rows = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, email, password_hash, profile, created_at
            FROM users
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.db)
        .await
        .context("list users")?;
        Ok(rows.into_iter().map(User::from).collect())
    }
}
