//! Platform boundary: the traits the orchestrator talks through, plus the
//! thin per-platform glue that implements them. The orchestrator itself
//! never sees platform vocabulary; these adapters translate transport
//! events into orchestrator calls and orchestrator effects into API calls.

use async_trait::async_trait;

use crate::channel::ChannelName;

pub mod discord;
pub mod discord_gateway;
pub mod discord_rest;
pub mod helix;
pub mod http_client;
pub mod twitch;
pub mod twitch_chat;

/// Limits for one issued invitation artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InviteSpec {
    pub max_uses: u32,
    /// Seconds until the artifact expires; 0 keeps it valid forever.
    pub max_age_secs: u64,
}

/// A created invitation artifact: the code identifies it for revocation,
/// the URL is what gets delivered to the redeemer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteArtifact {
    pub code: String,
    pub url: String,
}

/// The streaming-chat presence the bot maintains.
#[async_trait]
pub trait ChatHandle: Send + Sync {
    async fn join(&self, channel: &ChannelName) -> anyhow::Result<()>;
    async fn part(&self, channel: &ChannelName) -> anyhow::Result<()>;
    async fn say(&self, channel: &ChannelName, message: &str) -> anyhow::Result<()>;
    /// Private delivery to one user.
    async fn whisper(&self, username: &str, message: &str) -> anyhow::Result<()>;
}

/// The messaging guild's invitation surface.
#[async_trait]
pub trait GuildHandle: Send + Sync {
    /// Create a unique invite at the guild's designated invite point.
    async fn create_invite(&self, guild_id: &str, spec: InviteSpec)
        -> anyhow::Result<InviteArtifact>;
    async fn delete_invite(&self, code: &str) -> anyhow::Result<()>;
}

/// The paid-redemption surface on the streaming platform.
#[async_trait]
pub trait RewardHandle: Send + Sync {
    /// Create the redeemable reward for a channel, returning its external
    /// id.
    async fn create_reward(&self, channel: &ChannelName) -> anyhow::Result<String>;
    async fn delete_reward(&self, channel: &ChannelName, reward_id: &str) -> anyhow::Result<()>;
}
