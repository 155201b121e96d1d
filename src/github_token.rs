use std::{collections::HashMap, fmt, sync::Arc, time::Duration as StdDuration};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, trace};

use crate::{
    app_token::AppAuthenticator,
    github_client::{GithubClient, UpstreamError},
};

/// GitHub issues installation tokens for one hour. Never trust a longer expiry.
const MAX_INSTALLATION_TOKEN_LIFETIME: StdDuration = StdDuration::from_secs(60 * 60);
const INSTALLATION_TOKEN_REFRESH_MARGIN: StdDuration = StdDuration::from_secs(60);

/// Token scoped to one installation, used for every repository level call.
#[derive(Clone)]
pub struct InstallationToken {
    bearer: String,
    installation_id: i64,
    expires_at: DateTime<Utc>,
}

impl InstallationToken {
    pub fn bearer(&self) -> &str {
        &self.bearer
    }

    pub fn installation_id(&self) -> i64 {
        self.installation_id
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        Duration::from_std(INSTALLATION_TOKEN_REFRESH_MARGIN)
            .is_ok_and(|m| now + m < self.expires_at)
    }
}

impl fmt::Debug for InstallationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallationToken")
            .field("bearer", &"<redacted>")
            .field("installation_id", &self.installation_id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[allow(clippy::indexing_slicing)] // For automock.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    /// Return an unexpired token for the installation, exchanging a new one when needed.
    async fn installation_token(&self, installation_id: i64) -> Result<InstallationToken>;
}

/// Trades app tokens for installation tokens and caches them per installation.
pub struct InstallationTokenExchanger<GH: GithubClient> {
    client: Arc<GH>,
    authenticator: Arc<AppAuthenticator>,
    cache: Mutex<HashMap<i64, InstallationToken>>,
    // Serializes exchanges per installation so concurrent deliveries share one token.
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl<GH: GithubClient> InstallationTokenExchanger<GH> {
    pub fn new(client: Arc<GH>, authenticator: Arc<AppAuthenticator>) -> Self {
        Self {
            client,
            authenticator,
            cache: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn cached(&self, installation_id: i64) -> Option<InstallationToken> {
        let now = Utc::now();
        self.cache
            .lock()
            .await
            .get(&installation_id)
            .filter(|t| t.is_fresh(now))
            .cloned()
    }

    async fn lock_for(&self, installation_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(installation_id).or_default())
    }

    async fn exchange(&self, installation_id: i64) -> Result<InstallationToken> {
        let app_token = self.authenticator.app_token()?;
        debug!(
            app_token_issued_at = %app_token.issued_at(),
            app_token_expires_at = %app_token.expires_at(),
            "exchanging app token for installation token"
        );
        let grant = match self
            .client
            .exchange_installation_token(&app_token, installation_id)
            .await
        {
            Ok(grant) => grant,
            Err(e) => {
                if let Some(UpstreamError::Unauthorized) = e.downcast_ref::<UpstreamError>() {
                    // The app token may have been revoked or clock-skewed, mint a new one next time.
                    self.authenticator.invalidate();
                }
                return Err(e);
            }
        };

        let max = Utc::now()
            + Duration::from_std(MAX_INSTALLATION_TOKEN_LIFETIME)
                .with_context(|| "invalid installation token lifetime")?;
        Ok(InstallationToken {
            bearer: grant.token,
            installation_id,
            expires_at: grant.expires_at.min(max),
        })
    }
}

#[async_trait]
impl<GH: GithubClient> TokenFetcher for InstallationTokenExchanger<GH> {
    #[instrument(skip(self))]
    async fn installation_token(&self, installation_id: i64) -> Result<InstallationToken> {
        if let Some(token) = self.cached(installation_id).await {
            trace!("using cached installation token");
            return Ok(token);
        }

        let lock = self.lock_for(installation_id).await;
        let _guard = lock.lock().await;
        // Another delivery may have refreshed it while we waited.
        if let Some(token) = self.cached(installation_id).await {
            trace!("using cached installation token (post-lock)");
            return Ok(token);
        }

        let token = self.exchange(installation_id).await?;
        self.cache
            .lock()
            .await
            .insert(installation_id, token.clone());
        info!(expires_at = %token.expires_at(), "installation token refreshed");
        Ok(token)
    }
}


#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        app_token::test::test_authenticator,
        github_client::{InstallationTokenGrant, MockGithubClient},
    };

    fn grant(token: &str, valid_for: Duration) -> InstallationTokenGrant {
        InstallationTokenGrant {
            token: token.to_owned(),
            expires_at: Utc::now() + valid_for,
        }
    }

    fn exchanger(client: MockGithubClient) -> InstallationTokenExchanger<MockGithubClient> {
        InstallationTokenExchanger::new(Arc::new(client), Arc::new(test_authenticator()))
    }

    #[tokio::test]
    async fn token_is_cached_per_installation() {
        let mut client = MockGithubClient::new();
        client
            .expect_exchange_installation_token()
            .withf(|_, id| *id == 1)
            .once()
            .returning(|_, _| Ok(grant("one", Duration::hours(1))));
        client
            .expect_exchange_installation_token()
            .withf(|_, id| *id == 2)
            .once()
            .returning(|_, _| Ok(grant("two", Duration::hours(1))));
        let ex = exchanger(client);

        assert_eq!(ex.installation_token(1).await.unwrap().bearer(), "one");
        assert_eq!(ex.installation_token(1).await.unwrap().bearer(), "one");
        let two = ex.installation_token(2).await.unwrap();
        assert_eq!(two.bearer(), "two");
        assert_eq!(two.installation_id(), 2);
    }

    #[tokio::test]
    async fn expired_token_is_never_reused() {
        let mut client = MockGithubClient::new();
        client
            .expect_exchange_installation_token()
            .once()
            .returning(|_, _| Ok(grant("fresh", Duration::hours(1))));
        let ex = exchanger(client);
        ex.cache.lock().await.insert(
            7,
            InstallationToken {
                bearer: "expired".to_owned(),
                installation_id: 7,
                expires_at: Utc::now() - Duration::seconds(1),
            },
        );

        assert_eq!(ex.installation_token(7).await.unwrap().bearer(), "fresh");
    }

    #[tokio::test]
    async fn token_about_to_expire_is_refreshed() {
        let mut client = MockGithubClient::new();
        client
            .expect_exchange_installation_token()
            .times(2)
            .returning(|_, _| Ok(grant("short", Duration::seconds(30))));
        let ex = exchanger(client);

        ex.installation_token(3).await.unwrap();
        ex.installation_token(3).await.unwrap();
    }

    #[tokio::test]
    async fn lifetime_is_clamped_client_side() {
        let mut client = MockGithubClient::new();
        client
            .expect_exchange_installation_token()
            .returning(|_, _| Ok(grant("long", Duration::hours(5))));
        let ex = exchanger(client);

        let token = ex.installation_token(1).await.unwrap();
        assert!(token.expires_at() <= Utc::now() + Duration::hours(1));
    }

    #[tokio::test]
    async fn failure_is_surfaced_and_not_cached() {
        let mut client = MockGithubClient::new();
        client
            .expect_exchange_installation_token()
            .times(2)
            .returning(|_, _| Err(anyhow!(UpstreamError::Unauthorized)));
        let ex = exchanger(client);

        let err = ex.installation_token(1).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UpstreamError>(),
            Some(UpstreamError::Unauthorized)
        ));
        assert!(ex.cache.lock().await.is_empty());
        assert!(ex.installation_token(1).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_exchange() {
        let mut client = MockGithubClient::new();
        client
            .expect_exchange_installation_token()
            .once()
            .returning(|_, _| Ok(grant("shared", Duration::hours(1))));
        let ex = Arc::new(exchanger(client));

        let handles = (0..8)
            .map(|_| {
                let ex = Arc::clone(&ex);
                tokio::spawn(async move { ex.installation_token(9).await })
            })
            .collect::<Vec<_>>();
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap().bearer(), "shared");
        }
    }
}
