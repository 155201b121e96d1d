use std::{
    fmt,
    sync::{Mutex, PoisonError},
    time::Duration as StdDuration,
};

use anyhow::{Context as _, Result, bail};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::github_config::GithubAppConfig;

/// GitHub rejects app tokens which live longer than 10 minutes.
pub const MAX_APP_TOKEN_LIFETIME: StdDuration = StdDuration::from_secs(10 * 60);
const MIN_APP_TOKEN_LIFETIME: StdDuration = StdDuration::from_secs(60);
// Re-mint a bit before expiry, so an in-flight request does not carry an expired token.
const APP_TOKEN_REFRESH_MARGIN: StdDuration = StdDuration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iat: i64,
    exp: i64,
    iss: String,
}

/// Short-lived JWT asserting the app identity. Only for `/app` endpoints.
#[derive(Clone)]
pub struct AppToken {
    bearer: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl AppToken {
    pub fn bearer(&self) -> &str {
        &self.bearer
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        Duration::from_std(APP_TOKEN_REFRESH_MARGIN).is_ok_and(|m| now + m < self.expires_at)
    }
}

impl fmt::Debug for AppToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppToken")
            .field("bearer", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// App ID and the RSA key it signs with. Loaded once at startup.
#[derive(Clone)]
pub struct AppCredential {
    app_id: i64,
    key: EncodingKey,
}

impl AppCredential {
    pub fn new(app_id: i64, private_key: &str) -> Result<Self> {
        // Keys passed through env vars often carry escaped newlines.
        let normalized = private_key.trim().replace("\\n", "\n");
        let p = pem::parse(normalized).with_context(|| "failed to parse GitHub private key")?;
        if !matches!(p.tag(), "RSA PRIVATE KEY" | "PRIVATE KEY") {
            bail!("GitHub private key must be an RSA private key, got: {}", p.tag());
        }
        let key = EncodingKey::from_rsa_pem(pem::encode(&p).as_bytes())
            .with_context(|| "failed to load GitHub private key as RSA key")?;
        Ok(Self { app_id, key })
    }

    pub fn app_id(&self) -> i64 {
        self.app_id
    }
}

impl fmt::Debug for AppCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppCredential")
            .field("app_id", &self.app_id)
            .field("key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

/// Mints app tokens and keeps the last one while it is fresh.
#[derive(Debug)]
pub struct AppAuthenticator {
    credential: AppCredential,
    lifetime: StdDuration,
    cached: Mutex<Option<AppToken>>,
}

impl AppAuthenticator {
    pub fn new(credential: AppCredential, lifetime: StdDuration) -> Self {
        Self {
            credential,
            lifetime: lifetime.clamp(MIN_APP_TOKEN_LIFETIME, MAX_APP_TOKEN_LIFETIME),
            cached: Mutex::new(None),
        }
    }

    pub fn from_config(config: &GithubAppConfig) -> Result<Self> {
        let credential = AppCredential::new(config.app_id, &config.private_key)?;
        Ok(Self::new(credential, config.app_token_lifetime.into()))
    }

    pub fn app_id(&self) -> i64 {
        self.credential.app_id()
    }

    /// Return the cached token, or mint a new one when it is about to expire.
    pub fn app_token(&self) -> Result<AppToken> {
        let now = Utc::now();
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(now)) {
            return Ok(token.clone());
        }
        let token = self.mint_at(now)?;
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Drop the cached token, e.g. after GitHub rejected it.
    pub fn invalidate(&self) {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if cached.take().is_some() {
            debug!("invalidated cached app token");
        }
    }

    fn mint_at(&self, now: DateTime<Utc>) -> Result<AppToken> {
        let lifetime =
            Duration::from_std(self.lifetime).with_context(|| "invalid app token lifetime")?;
        let expires_at = now + lifetime;
        let claims = Claims {
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            iss: self.credential.app_id.to_string(),
        };
        let bearer = encode(&Header::new(Algorithm::RS256), &claims, &self.credential.key)
            .with_context(|| "failed to sign app token")?;
        debug!(app_id = self.credential.app_id, %expires_at, "minted app token");
        Ok(AppToken {
            bearer,
            issued_at: now,
            expires_at,
        })
    }
}
