use std::{fmt::Display, net::SocketAddr, str::FromStr};

use anyhow::Context;
use serde::Deserialize;

use crate::auth::password::{HashScheme, BCRYPT_COST_RANGE, DEFAULT_BCRYPT_COST};

/// Longest token lifetime accepted from configuration (one year).
pub const MAX_JWT_TTL_MINUTES: i64 = 60 * 24 * 365;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
}

/// Password hashing and login disclosure settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub hash_scheme: HashScheme,
    pub hash_cost: u32,
    /// Tell the client whether the email or the password was wrong.
    pub disclose_credential_fault: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            hash_scheme: HashScheme::Bcrypt,
            hash_cost: DEFAULT_BCRYPT_COST,
            disclose_credential_fault: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub store: StoreKind,
    pub database_url: Option<String>,
    pub jwt: JwtConfig,
    pub auth: AuthConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from `var`, failing on any value that is set but
    /// unusable rather than falling back to its default.
    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = &var as &dyn Fn(&str) -> Option<String>;

        let host = var("APP_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = parsed(var, "APP_PORT", 8080)?;
        let listen_addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .with_context(|| format!("invalid APP_HOST `{host}`"))?;

        let store = match var("USER_STORE").as_deref() {
            Some("memory") => StoreKind::Memory,
            Some("postgres") | None => StoreKind::Postgres,
            Some(other) => anyhow::bail!("unknown USER_STORE `{other}`"),
        };
        let database_url = var("DATABASE_URL");
        if store == StoreKind::Postgres && database_url.is_none() {
            anyhow::bail!("DATABASE_URL is required when USER_STORE=postgres");
        }

        let jwt = JwtConfig {
            secret: var("JWT_SECRET").context("JWT_SECRET is not set")?,
            issuer: var("JWT_ISSUER").unwrap_or_else(|| "credvault".into()),
            audience: var("JWT_AUDIENCE").unwrap_or_else(|| "credvault-users".into()),
            ttl_minutes: parsed(var, "JWT_TTL_MINUTES", 60)?,
        };
        if !(1..=MAX_JWT_TTL_MINUTES).contains(&jwt.ttl_minutes) {
            anyhow::bail!(
                "JWT_TTL_MINUTES must be between 1 and {MAX_JWT_TTL_MINUTES}, got {}",
                jwt.ttl_minutes
            );
        }

        let defaults = AuthConfig::default();
        let auth = AuthConfig {
            hash_scheme: parsed(var, "PASSWORD_HASH_SCHEME", defaults.hash_scheme)?,
            hash_cost: parsed(var, "PASSWORD_HASH_COST", defaults.hash_cost)?,
            disclose_credential_fault: match var("AUTH_DISCLOSE_CREDENTIAL_FAULT") {
                Some(raw) => parse_flag(&raw)
                    .with_context(|| format!("invalid AUTH_DISCLOSE_CREDENTIAL_FAULT `{raw}`"))?,
                None => defaults.disclose_credential_fault,
            },
        };
        if !BCRYPT_COST_RANGE.contains(&auth.hash_cost) {
            anyhow::bail!(
                "PASSWORD_HASH_COST must be between {} and {}, got {}",
                BCRYPT_COST_RANGE.start(),
                BCRYPT_COST_RANGE.end(),
                auth.hash_cost
            );
        }

        Ok(Self {
            listen_addr,
            store,
            database_url,
            jwt,
            auth,
        })
    }
}

fn parsed<T>(var: &dyn Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key} `{raw}`: {e}")),
        None => Ok(default),
    }
}

fn parse_flag(raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("expected true/false, 1/0, yes/no or on/off"),
    }
}
