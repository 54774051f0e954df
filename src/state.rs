use std::sync::Arc;

use anyhow::Context;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{info, warn};

use crate::auth::{
    jwt::JwtKeys,
    memory::MemoryUserStore,
    password::SchemeHasher,
    repo::{PgUserStore, UserStore},
    services::CredentialAuthority,
};
use crate::config::{AppConfig, StoreKind};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub authority: Arc<CredentialAuthority>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let store: Arc<dyn UserStore> = match config.store {
            StoreKind::Postgres => {
                let url = config
                    .database_url
                    .as_deref()
                    .context("DATABASE_URL is not set")?;
                let db = connect(url).await?;
                Arc::new(PgUserStore::new(db))
            }
            StoreKind::Memory => {
                warn!("using in-memory user store; accounts are lost on restart");
                Arc::new(MemoryUserStore::new())
            }
        };

        Ok(Self::from_parts(config, store))
    }

    pub fn from_parts(config: Arc<AppConfig>, store: Arc<dyn UserStore>) -> Self {
        let issuer = Arc::new(JwtKeys::from_config(&config.jwt));
        let hasher = Arc::new(SchemeHasher::new(
            config.auth.hash_scheme,
            config.auth.hash_cost,
        ));
        let authority = Arc::new(CredentialAuthority::new(store, issuer, hasher));
        Self { config, authority }
    }

    #[cfg(test)]
    pub fn fake() -> Self {
        use crate::config::{AuthConfig, JwtConfig};

        let config = Arc::new(AppConfig {
            listen_addr: ([127, 0, 0, 1], 0).into(),
            store: StoreKind::Memory,
            database_url: None,
            jwt: JwtConfig {
                secret: "test".into(),
                issuer: "test".into(),
                audience: "test".into(),
                ttl_minutes: 5,
            },
            auth: AuthConfig {
                hash_cost: 4,
                ..AuthConfig::default()
            },
        });
        Self::from_parts(config, Arc::new(MemoryUserStore::new()))
    }
}

async fn connect(url: &str) -> anyhow::Result<PgPool> {
    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .context("run migrations")?;
    info!("database migrations applied");

    Ok(db)
}
