use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec, TokenReviewStatus, UserInfo};
use kube::api::{Api, PostParams};
use kube::Client;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::cache::TtlCache;

const REVIEW_CACHE_SIZE: usize = 1024;
const REVIEW_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("user is not authenticated: {0}")]
    NotAuthenticated(String),

    #[error("token review failed: {0}")]
    Review(String),
}

/// Resolves a bearer token to the identity behind it. Production posts
/// TokenReviews to the cluster; tests substitute fixed identities.
#[async_trait]
pub trait TokenAuthenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<UserInfo, AuthError>;
}

/// Posts a TokenReview to the API server. Split out so the authenticator
/// can be exercised without a cluster.
#[async_trait]
pub trait TokenReviewer: Send + Sync {
    async fn create_token_review(&self, token: &str) -> Result<TokenReviewStatus, AuthError>;
}

pub struct ApiTokenReviewer {
    client: Client,
}

impl ApiTokenReviewer {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TokenReviewer for ApiTokenReviewer {
    async fn create_token_review(&self, token: &str) -> Result<TokenReviewStatus, AuthError> {
        let review = TokenReview {
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        Api::all(self.client.clone())
            .create(&PostParams::default(), &review)
            .await
            .map_err(|err| AuthError::Review(err.to_string()))?
            .status
            .ok_or_else(|| AuthError::Review("token review returned no status".to_string()))
    }
}

/// TokenReview adapter with a bounded TTL cache. Only successful reviews
/// are cached, so a revoked token stops working within the TTL window.
pub struct Tokens<R = ApiTokenReviewer> {
    reviewer: R,
    cache: Mutex<TtlCache<UserInfo>>,
}

impl<R: TokenReviewer> Tokens<R> {
    pub fn new(reviewer: R) -> Self {
        Self {
            reviewer,
            cache: Mutex::new(TtlCache::new(REVIEW_CACHE_SIZE, REVIEW_TTL)),
        }
    }
}

#[async_trait]
impl<R: TokenReviewer> TokenAuthenticator for Tokens<R> {
    async fn authenticate(&self, token: &str) -> Result<UserInfo, AuthError> {
        if let Some(user) = self.cache.lock().get(token) {
            return Ok(user);
        }

        let status = self.reviewer.create_token_review(token).await?;
        let user = status.user.unwrap_or_default();

        if status.authenticated != Some(true) {
            return Err(AuthError::NotAuthenticated(
                status.error.unwrap_or_default(),
            ));
        }

        debug!(
            username = user.username.as_deref().unwrap_or_default(),
            "authenticated token"
        );
        self.cache.lock().put(token.to_string(), user.clone());
        Ok(user)
    }
}

/// Identity equality as the dispatcher needs it: same username, same UID.
pub fn matching_users(a: &UserInfo, b: &UserInfo) -> bool {
    a.username == b.username && a.uid == b.uid
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingReviewer {
        calls: AtomicUsize,
        authenticated: bool,
    }

    impl CountingReviewer {
        fn new(authenticated: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                authenticated,
            }
        }
    }

    #[async_trait]
    impl TokenReviewer for CountingReviewer {
        async fn create_token_review(&self, token: &str) -> Result<TokenReviewStatus, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(TokenReviewStatus {
                authenticated: Some(self.authenticated),
                user: Some(UserInfo {
                    username: Some(format!("system:serviceaccount:ns-a:{token}")),
                    uid: Some("uid-1".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn successful_reviews_are_cached() {
        let tokens = Tokens::new(CountingReviewer::new(true));

        let first = tokens.authenticate("sa-token").await.unwrap();
        let second = tokens.authenticate("sa-token").await.unwrap();

        assert!(matching_users(&first, &second));
        assert_eq!(tokens.reviewer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_reviews_are_not_cached() {
        let tokens = Tokens::new(CountingReviewer::new(false));

        assert!(tokens.authenticate("bad").await.is_err());
        assert!(tokens.authenticate("bad").await.is_err());
        assert_eq!(tokens.reviewer.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn identity_comparison_uses_username_and_uid() {
        let a = UserInfo {
            username: Some("u".to_string()),
            uid: Some("1".to_string()),
            ..Default::default()
        };
        let mut b = a.clone();
        assert!(matching_users(&a, &b));

        b.uid = Some("2".to_string());
        assert!(!matching_users(&a, &b));
    }
}
