//! HS256 bearer tokens. Identity is issued upstream; the ledger validates,
//! and issuing exists for tooling and tests.

use crate::auth::models::{Claims, Role};
use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use tracing::{debug, warn};

const DEFAULT_TTL_HOURS: i64 = 24;
const MIN_SECRET_LEN: usize = 32;
const LEEWAY_SECS: u64 = 30;

pub struct JwtHandler {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl JwtHandler {
    pub fn new(secret: String) -> Self {
        Self::with_ttl(&secret, Duration::hours(DEFAULT_TTL_HOURS))
    }

    pub fn with_ttl(secret: &str, ttl: Duration) -> Self {
        if secret.len() < MIN_SECRET_LEN {
            warn!("JWT secret is shorter than {} bytes", MIN_SECRET_LEN);
        }
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = LEEWAY_SECS;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl,
        }
    }

    /// Returns the token and its lifetime in seconds.
    pub fn generate_token(&self, user_id: &str, role: Role) -> Result<(String, usize)> {
        let exp = Utc::now()
            .checked_add_signed(self.ttl)
            .context("Token expiry overflows")?
            .timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            role,
            exp: usize::try_from(exp).context("Token expiry before epoch")?,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .context("Failed to sign JWT")?;
        debug!(user = user_id, role = role.as_str(), "Issued JWT");

        let lifetime = usize::try_from(self.ttl.num_seconds()).unwrap_or(0);
        Ok((token, lifetime))
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let claims = decode::<Claims>(token, &self.decoding, &self.validation)
            .context("Invalid or expired token")?
            .claims;
        if claims.sub.trim().is_empty() {
            bail!("Token has no subject");
        }
        Ok(claims)
    }
}
