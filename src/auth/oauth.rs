use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Deserialize;
use tracing::{error, info};

use crate::adapters::http_client::HttpClient;
use crate::error::{Result, UsherError};
use crate::store::TokenData;

/// Scopes requested from the channel owner.
pub const SCOPES: &str = "channel:manage:redemptions";

const DEFAULT_AUTH_BASE: &str = "https://id.twitch.tv";

/// Successful response from the platform token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Refresh grants rotate the refresh token; the field can be missing
    /// on some responses, in which case the previous one stays valid.
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Vec<String>,
}

impl TokenResponse {
    /// Convert to store form. `previous_refresh_token` fills the gap when
    /// the endpoint omitted rotation.
    pub fn into_token_data(self, previous_refresh_token: Option<String>) -> TokenData {
        TokenData {
            access_token: self.access_token,
            refresh_token: self
                .refresh_token
                .or(previous_refresh_token)
                .unwrap_or_default(),
            expires_at: self
                .expires_in
                .map(|secs| Utc::now() + Duration::seconds(secs)),
        }
    }
}

/// Client for the platform's OAuth endpoints: authorize-URL construction,
/// the authorization-code exchange, and refresh grants.
pub struct OAuthClient {
    http: Arc<dyn HttpClient>,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    base_url: String,
}

impl OAuthClient {
    pub fn new(
        http: Arc<dyn HttpClient>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            http,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
            base_url: DEFAULT_AUTH_BASE.to_string(),
        }
    }

    /// Point the client at a different endpoint host. Tests aim this at a
    /// local mock server.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// The URL the channel owner visits to grant access. `state` is the
    /// tracker's session token.
    pub fn authorize_url(&self, state: &str) -> String {
        format!(
            "{}/oauth2/authorize?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
            self.base_url, self.client_id, self.redirect_uri, SCOPES, state
        )
    }

    /// Exchange an authorization code for a token pair.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenResponse> {
        let url = format!(
            "{}/oauth2/token?client_id={}&client_secret={}&code={}&grant_type=authorization_code&redirect_uri={}",
            self.base_url, self.client_id, self.client_secret, code, self.redirect_uri
        );
        let response = self.post_token(&url, "code exchange").await?;
        info!("Authorization code exchanged");
        Ok(response)
    }

    /// Trade a refresh token for a fresh token pair.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let url = format!(
            "{}/oauth2/token?client_id={}&client_secret={}&grant_type=refresh_token&refresh_token={}",
            self.base_url, self.client_id, self.client_secret, refresh_token
        );
        self.post_token(&url, "token refresh").await
    }

    async fn post_token(&self, url: &str, context: &str) -> Result<TokenResponse> {
        let response = self
            .http
            .post(url, HashMap::new(), String::new())
            .await
            .map_err(|err| UsherError::upstream(format!("{context} request failed: {err}")))?;
        if !response.is_success() {
            error!(
                status = response.status(),
                body = response.body(),
                "Token endpoint rejected {}",
                context
            );
            return Err(UsherError::upstream(format!(
                "{context} rejected with status {}",
                response.status()
            )));
        }
        response
            .json::<TokenResponse>()
            .map_err(|err| UsherError::upstream(format!("{context} returned malformed body: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::http_client::ReqwestHttpClient;

    fn client(base_url: &str) -> OAuthClient {
        OAuthClient::new(
            Arc::new(ReqwestHttpClient::new()),
            "client-id",
            "client-secret",
            "https://invites.example.com/platform-callback",
        )
        .with_base_url(base_url)
    }

    #[test]
    fn authorize_url_carries_state_and_scope() {
        let url = client("https://id.twitch.tv").authorize_url("state123");
        assert!(url.contains("state=state123"));
        assert!(url.contains("scope=channel:manage:redemptions"));
        assert!(url.contains("response_type=code"));
    }

    #[tokio::test]
    async fn exchange_parses_token_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth2/token")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{
                    "access_token": "acc",
                    "refresh_token": "ref",
                    "expires_in": 3600,
                    "scope": ["channel:manage:redemptions"]
                }"#,
            )
            .create_async()
            .await;

        let response = client(&server.url()).exchange_code("the-code").await.unwrap();
        mock.assert_async().await;
        assert_eq!(response.access_token, "acc");
        assert_eq!(response.refresh_token.as_deref(), Some("ref"));
        assert_eq!(response.scope.len(), 1);
    }

    #[tokio::test]
    async fn endpoint_rejection_is_upstream_not_user_detail() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/oauth2/token")
            .match_query(mockito::Matcher::Any)
            .with_status(400)
            .with_body(r#"{"status":400,"message":"Invalid authorization code"}"#)
            .create_async()
            .await;

        let err = client(&server.url()).exchange_code("bad").await.unwrap_err();
        assert!(err.is_internal());
        assert!(!err.user_message().contains("authorization code"));
    }

    #[test]
    fn refresh_rotation_falls_back_to_previous_token() {
        let response = TokenResponse {
            access_token: "acc".into(),
            refresh_token: None,
            expires_in: None,
            scope: vec![],
        };
        let data = response.into_token_data(Some("old-refresh".into()));
        assert_eq!(data.refresh_token, "old-refresh");
        assert_eq!(data.expires_at, None);
    }
}
