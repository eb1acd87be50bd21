use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use super::oauth::OAuthClient;
use crate::channel::ChannelName;
use crate::error::{Result, UsherError};
use crate::store::{Credential, CredentialStore, TokenData};

/// Authorized API handle for one channel. Hands out the current access
/// token, refreshing it past expiry and writing the rotated pair back to
/// the credential store before the caller proceeds.
pub struct ChannelClient {
    channel: ChannelName,
    token: RwLock<TokenData>,
    /// Serializes refreshes for this channel. The platform rotates refresh
    /// tokens, so two concurrent refreshes would leave a dead token in the
    /// store.
    refresh_gate: Mutex<()>,
    credentials: Arc<CredentialStore>,
    oauth: Arc<OAuthClient>,
}

impl std::fmt::Debug for ChannelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelClient")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl ChannelClient {
    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    /// The access token to put on the next API call.
    pub async fn access_token(&self) -> Result<String> {
        {
            let token = self.token.read().await;
            if !token.is_expired() {
                return Ok(token.access_token.clone());
            }
        }

        let _gate = self.refresh_gate.lock().await;
        // A concurrent caller may have refreshed while we waited.
        let refresh_token = {
            let token = self.token.read().await;
            if !token.is_expired() {
                return Ok(token.access_token.clone());
            }
            token.refresh_token.clone()
        };

        let response = self.oauth.refresh(&refresh_token).await?;
        let new_token = response.into_token_data(Some(refresh_token));
        *self.token.write().await = new_token.clone();
        info!(channel = %self.channel, "Access token refreshed");

        // Persist before returning control. If the write fails the fresh
        // token still serves this process; the next restart falls back to
        // the stale stored pair and re-authorization may be needed.
        match self.credentials.update_token(&self.channel, new_token.clone()).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(channel = %self.channel, "No stored credential to persist refreshed token to")
            }
            Err(err) => {
                warn!(channel = %self.channel, error = %err, "Failed to persist refreshed token")
            }
        }

        Ok(new_token.access_token)
    }
}

/// Per-channel credential vault. Clients are cached for the process
/// lifetime; the cache is bounded in practice by the number of linked
/// channels.
pub struct TokenVault {
    credentials: Arc<CredentialStore>,
    oauth: Arc<OAuthClient>,
    clients: DashMap<ChannelName, Arc<ChannelClient>>,
}

impl TokenVault {
    pub fn new(credentials: Arc<CredentialStore>, oauth: Arc<OAuthClient>) -> Self {
        Self {
            credentials,
            oauth,
            clients: DashMap::new(),
        }
    }

    /// The cached client for a channel, constructing one from the stored
    /// credential on first use.
    pub async fn client(&self, channel: &ChannelName) -> Result<Arc<ChannelClient>> {
        if let Some(client) = self.clients.get(channel) {
            return Ok(client.clone());
        }

        let credential = self
            .credentials
            .get(channel)
            .await?
            .ok_or_else(|| {
                UsherError::not_found(format!("{channel} has not authorized the bot yet"))
            })?;

        let client = Arc::new(ChannelClient {
            channel: channel.clone(),
            token: RwLock::new(credential.token),
            refresh_gate: Mutex::new(()),
            credentials: self.credentials.clone(),
            oauth: self.oauth.clone(),
        });
        self.clients.insert(channel.clone(), client.clone());
        Ok(client)
    }

    /// Complete the authorization-code exchange for a channel: trade the
    /// code, upsert the credential, and drop any stale cached client so
    /// the next call picks up the new grant.
    pub async fn exchange_authorization_code(
        &self,
        channel: &ChannelName,
        code: &str,
    ) -> Result<Credential> {
        let response = self.oauth.exchange_code(code).await?;
        let credential = Credential {
            channel: channel.clone(),
            authorization_code: code.to_string(),
            scopes: response.scope.clone(),
            token: response.into_token_data(None),
        };
        self.credentials.upsert(credential.clone()).await?;
        self.clients.remove(channel);
        info!(channel = %channel, "Credential stored");
        Ok(credential)
    }
}
