use std::time::Duration;

use anyhow::Context;
#[cfg(test)]
use jsonwebtoken::{decode, DecodingKey, Validation};
use jsonwebtoken::{encode, EncodingKey, Header};
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::debug;

use crate::auth::claims::{Claims, TokenClaims};
use crate::config::{JwtConfig, MAX_JWT_TTL_MINUTES};

/// Signs claims into an opaque token string.
pub trait TokenIssuer: Send + Sync {
    fn sign(&self, claims: &TokenClaims) -> anyhow::Result<String>;
}

/// HS256 keys derived from the server secret, plus issuer settings.
#[derive(Clone)]
pub struct JwtKeys {
    pub encoding: EncodingKey,
    #[cfg(test)]
    pub decoding: DecodingKey,
    pub issuer: String,
    pub audience: String,
    pub ttl: Duration,
}

impl JwtKeys {
    pub fn from_config(cfg: &JwtConfig) -> Self {
        let ttl_minutes = cfg.ttl_minutes.clamp(0, MAX_JWT_TTL_MINUTES) as u64;
        Self {
            encoding: EncodingKey::from_secret(cfg.secret.as_bytes()),
            #[cfg(test)]
            decoding: DecodingKey::from_secret(cfg.secret.as_bytes()),
            issuer: cfg.issuer.clone(),
            audience: cfg.audience.clone(),
            ttl: Duration::from_secs(ttl_minutes * 60),
        }
    }

    /// Decodes and validates a token signed by these keys.
    #[cfg(test)]
    pub fn verify(&self, token: &str) -> anyhow::Result<Claims> {
        let mut validation = Validation::default();
        validation.set_audience(std::slice::from_ref(&self.audience));
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        let data = decode::<Claims>(token, &self.decoding, &validation)?;
        debug!(user_id = %data.claims.id, "jwt verified");
        Ok(data.claims)
    }
}

impl TokenIssuer for JwtKeys {
    fn sign(&self, claims: &TokenClaims) -> anyhow::Result<String> {
        let now = OffsetDateTime::now_utc();
        let ttl_secs = i64::try_from(self.ttl.as_secs()).context("token ttl out of range")?;
        let exp = now
            .checked_add(TimeDuration::seconds(ttl_secs))
            .context("token expiry out of range")?;
        let payload = Claims {
            id: claims.id,
            iat: now.unix_timestamp() as usize,
            exp: exp.unix_timestamp() as usize,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };
        let token = encode(&Header::default(), &payload, &self.encoding)?;
        debug!(user_id = %claims.id, "jwt signed");
        Ok(token)
    }
}
