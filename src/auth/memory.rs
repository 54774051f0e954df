use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::auth::{
    repo::UserStore,
    repo_types::{NewUserRecord, StoreError, User},
};

/// Process-local store. The email check and the insert happen under one
/// write lock, so concurrent enrollments can't both win.
#[derive(Default)]
pub struct MemoryUserStore {
    users: RwLock<Vec<User>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn insert(&self, record: NewUserRecord) -> Result<User, StoreError> {
        let mut users = self.users.write().await;
        if users.iter().any(|u| u.email == record.email) {
            return Err(StoreError::DuplicateKey { field: "email" });
        }
        let user = User {
            id: Uuid::new_v4(),
            email: record.email,
            password_hash: record.password_hash,
            created_at: OffsetDateTime::now_utc(),
            profile: record.profile,
        };
        users.push(user.clone());
        Ok(user)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let users = self.users.read().await;
        Ok(users.iter().find(|u| u.email == email).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let users = self.users.read().await;
        Ok(users.iter().find(|u| u.id == id).cloned())
    }

    async fn find_all(&self) -> Result<Vec<User>, StoreError> {
        Ok(self.users.read().await.clone())
    }
}
