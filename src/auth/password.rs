use std::{ops::RangeInclusive, str::FromStr};

use argon2::{
    password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString},
    Argon2,
};
use rand::rngs::OsRng;
use serde::Deserialize;
use tracing::{error, warn};

/// bcrypt work factor used for new accounts unless configured otherwise.
pub const DEFAULT_BCRYPT_COST: u32 = 10;

/// One-way salted password hashing.
///
/// `verify` returns `Ok(false)` on a mismatch and an error only when the
/// stored hash can't be parsed.
pub trait PasswordHasher: Send + Sync {
    fn hash(&self, plain: &str) -> anyhow::Result<String>;
    fn verify(&self, plain: &str, hash: &str) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashScheme {
    Bcrypt,
    Argon2,
}

impl FromStr for HashScheme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bcrypt" => Ok(Self::Bcrypt),
            "argon2" => Ok(Self::Argon2),
            other => anyhow::bail!("unknown password hash scheme `{other}`"),
        }
    }
}

impl HashScheme {
    /// Scheme that produced `hash`, read from its PHC/modular-crypt prefix.
    pub fn detect(hash: &str) -> Option<Self> {
        if hash.starts_with("$argon2") {
            Some(Self::Argon2)
        } else if hash.starts_with("$2") {
            Some(Self::Bcrypt)
        } else {
            None
        }
    }
}

/// Valid bcrypt work factors.
pub const BCRYPT_COST_RANGE: RangeInclusive<u32> = 4..=31;

#[derive(Debug, Clone, Copy)]
pub struct BcryptHasher {
    cost: u32,
}

impl BcryptHasher {
    pub fn new(cost: u32) -> Self {
        Self { cost }
    }
}

impl Default for BcryptHasher {
    fn default() -> Self {
        Self::new(DEFAULT_BCRYPT_COST)
    }
}

impl PasswordHasher for BcryptHasher {
    fn hash(&self, plain: &str) -> anyhow::Result<String> {
        bcrypt::hash(plain, self.cost).map_err(|e| {
            error!(error = %e, cost = self.cost, "bcrypt hash error");
            anyhow::anyhow!(e.to_string())
        })
    }

    fn verify(&self, plain: &str, hash: &str) -> anyhow::Result<bool> {
        bcrypt::verify(plain, hash).map_err(|e| {
            error!(error = %e, "bcrypt parse hash error");
            anyhow::anyhow!(e.to_string())
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Argon2Hasher;

impl PasswordHasher for Argon2Hasher {
    fn hash(&self, plain: &str) -> anyhow::Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(plain.as_bytes(), &salt)
            .map_err(|e| {
                error!(error = %e, "argon2 hash_password error");
                anyhow::anyhow!(e.to_string())
            })?
            .to_string();
        Ok(hash)
    }

    fn verify(&self, plain: &str, hash: &str) -> anyhow::Result<bool> {
        let parsed = PasswordHash::new(hash).map_err(|e| {
            error!(error = %e, "argon2 parse hash error");
            anyhow::anyhow!(e.to_string())
        })?;
        Ok(Argon2::default()
            .verify_password(plain.as_bytes(), &parsed)
            .is_ok())
    }
}

/// Hashes new passwords with the configured scheme and verifies a stored
/// hash with whichever scheme produced it, so switching schemes keeps
/// existing accounts working.
#[derive(Debug, Clone, Copy)]
pub struct SchemeHasher {
    scheme: HashScheme,
    bcrypt: BcryptHasher,
    argon2: Argon2Hasher,
}

impl SchemeHasher {
    /// `bcrypt_cost` only applies to new bcrypt hashes; Argon2 uses its
    /// default parameters.
    pub fn new(scheme: HashScheme, bcrypt_cost: u32) -> Self {
        Self {
            scheme,
            bcrypt: BcryptHasher::new(bcrypt_cost),
            argon2: Argon2Hasher,
        }
    }
}

impl PasswordHasher for SchemeHasher {
    fn hash(&self, plain: &str) -> anyhow::Result<String> {
        match self.scheme {
            HashScheme::Bcrypt => self.bcrypt.hash(plain),
            HashScheme::Argon2 => self.argon2.hash(plain),
        }
    }

    fn verify(&self, plain: &str, hash: &str) -> anyhow::Result<bool> {
        match HashScheme::detect(hash) {
            Some(HashScheme::Bcrypt) => self.bcrypt.verify(plain, hash),
            Some(HashScheme::Argon2) => self.argon2.verify(plain, hash),
            None => {
                warn!("stored password hash has an unknown format");
                anyhow::bail!("unrecognized password hash format")
            }
        }
    }
}
