use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::http_client::HttpClient;
use super::RewardHandle;
use crate::auth::{ChannelClient, TokenVault};
use crate::channel::ChannelName;

const DEFAULT_API_BASE: &str = "https://api.twitch.tv";

/// Title and cost of the reward created for ChannelPoints-mode links.
const REWARD_TITLE: &str = "Server invite";
const REWARD_COST: u32 = 1000;

#[derive(Deserialize)]
struct DataEnvelope<T> {
    data: Vec<T>,
}

#[derive(Deserialize)]
struct HelixUser {
    id: String,
}

#[derive(Deserialize)]
struct HelixReward {
    id: String,
}

/// Streaming-platform REST surface the orchestrator needs: resolving a
/// channel login to its user id and managing the custom reward. Every
/// call authenticates with the channel owner's vaulted token.
pub struct HelixRewards {
    http: Arc<dyn HttpClient>,
    vault: Arc<TokenVault>,
    client_id: String,
    base_url: String,
}

impl HelixRewards {
    pub fn new(http: Arc<dyn HttpClient>, vault: Arc<TokenVault>, client_id: impl Into<String>) -> Self {
        Self {
            http,
            vault,
            client_id: client_id.into(),
            base_url: DEFAULT_API_BASE.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn headers(&self, client: &ChannelClient) -> anyhow::Result<HashMap<String, String>> {
        let token = client.access_token().await?;
        Ok(HashMap::from([
            ("Client-Id".to_string(), self.client_id.clone()),
            ("Authorization".to_string(), format!("Bearer {token}")),
            ("Content-Type".to_string(), "application/json".to_string()),
        ]))
    }

    async fn broadcaster_id(
        &self,
        channel: &ChannelName,
        client: &ChannelClient,
    ) -> anyhow::Result<String> {
        let url = format!("{}/helix/users?login={}", self.base_url, channel.login());
        let response = self.http.get(&url, self.headers(client).await?).await?;
        if !response.is_success() {
            anyhow::bail!(
                "user lookup for {channel} failed with status {}",
                response.status()
            );
        }
        let envelope: DataEnvelope<HelixUser> = response.json()?;
        envelope
            .data
            .into_iter()
            .next()
            .map(|user| user.id)
            .ok_or_else(|| anyhow::anyhow!("no user found for {channel}"))
    }
}

#[async_trait]
impl RewardHandle for HelixRewards {
    async fn create_reward(&self, channel: &ChannelName) -> anyhow::Result<String> {
        let client = self.vault.client(channel).await?;
        let broadcaster_id = self.broadcaster_id(channel, &client).await?;
        let url = format!(
            "{}/helix/channel_points/custom_rewards?broadcaster_id={broadcaster_id}",
            self.base_url
        );
        let body = serde_json::json!({
            "title": REWARD_TITLE,
            "cost": REWARD_COST,
            "is_user_input_required": false,
        })
        .to_string();
        let response = self
            .http
            .post(&url, self.headers(&client).await?, body)
            .await?;
        if !response.is_success() {
            anyhow::bail!(
                "reward creation for {channel} failed with status {}: {}",
                response.status(),
                response.body()
            );
        }
        let envelope: DataEnvelope<HelixReward> = response.json()?;
        let reward = envelope
            .data
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("reward creation returned no reward"))?;
        info!(channel = %channel, reward = %reward.id, "Reward created");
        Ok(reward.id)
    }

    async fn delete_reward(&self, channel: &ChannelName, reward_id: &str) -> anyhow::Result<()> {
        let client = self.vault.client(channel).await?;
        let broadcaster_id = self.broadcaster_id(channel, &client).await?;
        let url = format!(
            "{}/helix/channel_points/custom_rewards?broadcaster_id={broadcaster_id}&id={reward_id}",
            self.base_url
        );
        let response = self.http.delete(&url, self.headers(&client).await?).await?;
        if !response.is_success() {
            anyhow::bail!(
                "reward deletion for {channel} failed with status {}",
                response.status()
            );
        }
        info!(channel = %channel, reward = reward_id, "Reward deleted");
        Ok(())
    }
}
