use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::http_client::HttpClient;
use super::{GuildHandle, InviteArtifact, InviteSpec};

const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";
const INVITE_URL_BASE: &str = "https://discord.gg";

/// Permission bit for ADMINISTRATOR in the guild permission set.
const ADMINISTRATOR: u64 = 1 << 3;

#[derive(Debug, Clone, Deserialize)]
pub struct GuildInfo {
    pub owner_id: String,
    /// Channel invites land in when none is specified; the guild's
    /// designated invite point.
    pub system_channel_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildRole {
    pub id: String,
    pub name: String,
    permissions: String,
}

impl GuildRole {
    pub fn is_administrator(&self) -> bool {
        self.permissions
            .parse::<u64>()
            .map(|bits| bits & ADMINISTRATOR != 0)
            .unwrap_or(false)
    }
}

#[derive(Deserialize)]
struct CreatedInvite {
    code: String,
}

#[derive(Deserialize)]
struct DmChannel {
    id: String,
}

/// Messaging-platform REST client: invites, messages, DMs, and the guild
/// metadata the permission checks need.
pub struct DiscordRestClient {
    http: Arc<dyn HttpClient>,
    token: String,
    base_url: String,
}

impl DiscordRestClient {
    pub fn new(http: Arc<dyn HttpClient>, token: impl Into<String>) -> Self {
        Self {
            http,
            token: token.into(),
            base_url: DEFAULT_API_BASE.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn headers(&self) -> HashMap<String, String> {
        HashMap::from([
            ("Authorization".to_string(), format!("Bot {}", self.token)),
            ("Content-Type".to_string(), "application/json".to_string()),
        ])
    }

    pub async fn guild(&self, guild_id: &str) -> anyhow::Result<GuildInfo> {
        let url = format!("{}/guilds/{guild_id}", self.base_url);
        let response = self.http.get(&url, self.headers()).await?;
        if !response.is_success() {
            anyhow::bail!("guild lookup failed with status {}", response.status());
        }
        Ok(response.json()?)
    }

    pub async fn guild_roles(&self, guild_id: &str) -> anyhow::Result<Vec<GuildRole>> {
        let url = format!("{}/guilds/{guild_id}/roles", self.base_url);
        let response = self.http.get(&url, self.headers()).await?;
        if !response.is_success() {
            anyhow::bail!("role lookup failed with status {}", response.status());
        }
        Ok(response.json()?)
    }

    pub async fn send_message(&self, channel_id: &str, content: &str) -> anyhow::Result<()> {
        let url = format!("{}/channels/{channel_id}/messages", self.base_url);
        let body = serde_json::json!({ "content": content }).to_string();
        let response = self.http.post(&url, self.headers(), body).await?;
        if !response.is_success() {
            anyhow::bail!("message send failed with status {}", response.status());
        }
        Ok(())
    }

    /// Open (or reuse) the DM channel with a user and send one message.
    pub async fn send_direct_message(&self, user_id: &str, content: &str) -> anyhow::Result<()> {
        let url = format!("{}/users/@me/channels", self.base_url);
        let body = serde_json::json!({ "recipient_id": user_id }).to_string();
        let response = self.http.post(&url, self.headers(), body).await?;
        if !response.is_success() {
            anyhow::bail!("DM channel open failed with status {}", response.status());
        }
        let dm: DmChannel = response.json()?;
        self.send_message(&dm.id, content).await
    }
}

#[async_trait]
impl GuildHandle for DiscordRestClient {
    async fn create_invite(
        &self,
        guild_id: &str,
        spec: InviteSpec,
    ) -> anyhow::Result<InviteArtifact> {
        let guild = self.guild(guild_id).await?;
        let channel_id = guild
            .system_channel_id
            .ok_or_else(|| anyhow::anyhow!("guild {guild_id} has no system channel"))?;

        let url = format!("{}/channels/{channel_id}/invites", self.base_url);
        let body = serde_json::json!({
            "max_uses": spec.max_uses,
            "max_age": spec.max_age_secs,
            "unique": true,
        })
        .to_string();
        let response = self.http.post(&url, self.headers(), body).await?;
        if !response.is_success() {
            anyhow::bail!("invite creation failed with status {}", response.status());
        }
        let invite: CreatedInvite = response.json()?;
        info!(guild = guild_id, code = %invite.code, "Invite created");
        Ok(InviteArtifact {
            url: format!("{INVITE_URL_BASE}/{}", invite.code),
            code: invite.code,
        })
    }

    async fn delete_invite(&self, code: &str) -> anyhow::Result<()> {
        let url = format!("{}/invites/{code}", self.base_url);
        let response = self.http.delete(&url, self.headers()).await?;
        if !response.is_success() {
            anyhow::bail!("invite deletion failed with status {}", response.status());
        }
        info!(code, "Invite deleted");
        Ok(())
    }
}
