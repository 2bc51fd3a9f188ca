use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::oauth::{OAuthClient, OAuthError, OAuthToken};

#[derive(Debug, Error)]
pub enum TokenProviderError {
    #[error("oauth client is required to refresh expired token")]
    MissingOAuthClient,
    #[error("refresh token is missing")]
    MissingRefreshToken,
    #[error("oauth refresh failed: {0}")]
    OAuth(#[from] OAuthError),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OAuthState {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl OAuthState {
    pub fn from_access_token(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
            scope: None,
            token_type: Some("bearer".into()),
        }
    }

    pub fn from_oauth_token(token: &OAuthToken) -> Self {
        Self {
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.clone(),
            expires_at: token
                .expires_in
                .map(|secs| now_unix().saturating_add(secs as i64)),
            scope: token.scope.clone(),
            token_type: Some(token.token_type.clone()),
        }
    }
}

pub struct TokenProvider {
    state: OAuthState,
    oauth_client: Option<OAuthClient>,
    refresh_skew_secs: i64,
}

impl TokenProvider {
    pub fn new(state: OAuthState, oauth_client: Option<OAuthClient>) -> Self {
        Self {
            state,
            oauth_client,
            refresh_skew_secs: 60,
        }
    }

    pub async fn valid_access_token(&mut self) -> Result<String, TokenProviderError> {
        if self.should_refresh() {
            self.refresh().await?;
        }
        Ok(self.state.access_token.clone())
    }

    pub fn state(&self) -> &OAuthState {
        &self.state
    }

    pub fn can_refresh(&self) -> bool {
        self.oauth_client.is_some() && self.state.refresh_token.is_some()
    }

    pub async fn refresh_now(&mut self) -> Result<String, TokenProviderError> {
        self.refresh().await?;
        Ok(self.state.access_token.clone())
    }

    fn should_refresh(&self) -> bool {
        let Some(expires_at) = self.state.expires_at else {
            return false;
        };
        self.can_refresh() && expires_at <= now_unix().saturating_add(self.refresh_skew_secs)
    }

    async fn refresh(&mut self) -> Result<(), TokenProviderError> {
        let refresh_token = self
            .state
            .refresh_token
            .clone()
            .ok_or(TokenProviderError::MissingRefreshToken)?;
        let client = self
            .oauth_client
            .as_ref()
            .ok_or(TokenProviderError::MissingOAuthClient)?;
        let token = client
            .refresh_token(&refresh_token, self.state.scope.as_deref())
            .await?;
        let mut refreshed = OAuthState::from_oauth_token(&token);
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = Some(refresh_token);
        }
        if refreshed.scope.is_none() {
            refreshed.scope = self.state.scope.clone();
        }
        tracing::info!(expires_at = ?refreshed.expires_at, "access token renewed");
        self.state = refreshed;
        Ok(())
    }
}

fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn expired_state(refresh_token: Option<&str>) -> OAuthState {
        OAuthState {
            access_token: "old-token".into(),
            refresh_token: refresh_token.map(Into::into),
            expires_at: Some(0),
            scope: Some("Files.ReadWrite offline_access".into()),
            token_type: Some("bearer".into()),
        }
    }

    #[tokio::test]
    async fn returns_current_token_when_not_expired() {
        let mut provider = TokenProvider::new(
            OAuthState {
                access_token: "token-1".into(),
                refresh_token: Some("refresh-1".into()),
                expires_at: Some(i64::MAX),
                scope: None,
                token_type: Some("bearer".into()),
            },
            None,
        );

        let token = provider
            .valid_access_token()
            .await
            .expect("token should be valid");
        assert_eq!(token, "token-1");
    }

    #[tokio::test]
    async fn refreshes_token_when_expired() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=refresh-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new-token",
                "token_type": "bearer",
                "expires_in": 3600,
                "refresh_token": "refresh-2"
            })))
            .mount(&server)
            .await;
        let oauth_client = OAuthClient::with_base_url(&server.uri(), "client-id")
            .expect("oauth client should be built");
        let mut provider = TokenProvider::new(expired_state(Some("refresh-1")), Some(oauth_client));

        let token = provider
            .valid_access_token()
            .await
            .expect("token should refresh");
        assert_eq!(token, "new-token");
        assert_eq!(provider.state().refresh_token.as_deref(), Some("refresh-2"));
        assert_eq!(
            provider.state().scope.as_deref(),
            Some("Files.ReadWrite offline_access")
        );
    }

    #[tokio::test]
    async fn expired_token_without_refresh_material_is_returned_as_is() {
        let mut provider = TokenProvider::new(expired_state(None), None);

        let token = provider.valid_access_token().await.unwrap();
        assert_eq!(token, "old-token");
    }

    #[tokio::test]
    async fn refresh_now_requires_refresh_token() {
        let mut provider = TokenProvider::new(expired_state(None), None);

        let err = provider
            .refresh_now()
            .await
            .expect_err("expected missing refresh token error");
        assert!(matches!(err, TokenProviderError::MissingRefreshToken));
    }

    #[tokio::test]
    async fn refresh_now_requires_oauth_client() {
        let mut provider = TokenProvider::new(expired_state(Some("refresh-1")), None);

        let err = provider
            .refresh_now()
            .await
            .expect_err("expected missing client error");
        assert!(matches!(err, TokenProviderError::MissingOAuthClient));
    }
}
