use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Database, StoreError};
use crate::channel::ChannelName;

/// Which viewer-facing mechanisms can trigger invite issuance for a
/// linked channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedemptionMode {
    Chat,
    ChannelPoints,
    Both,
}

impl RedemptionMode {
    pub fn from_flags(chat: bool, channel_points: bool) -> Option<Self> {
        match (chat, channel_points) {
            (true, true) => Some(Self::Both),
            (true, false) => Some(Self::Chat),
            (false, true) => Some(Self::ChannelPoints),
            (false, false) => None,
        }
    }

    pub fn includes_chat(self) -> bool {
        matches!(self, Self::Chat | Self::Both)
    }

    pub fn includes_channel_points(self) -> bool {
        matches!(self, Self::ChannelPoints | Self::Both)
    }

    /// Human wording used in replies.
    pub fn describe(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::ChannelPoints => "channel points",
            Self::Both => "chat and channel points",
        }
    }
}

/// Redemption limits and mode for one link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkOptions {
    /// How often one issued invite may be used. At least 1.
    pub usage_limit: u32,
    /// How long an issued invite stays valid, in seconds. 0 means forever.
    pub validity_secs: u64,
    pub mode: RedemptionMode,
}

/// The durable binding between one streaming-chat channel and one guild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub channel: ChannelName,
    pub guild_id: String,
    pub options: LinkOptions,
    /// External id of the paid reward, present exactly when the mode
    /// includes channel points.
    pub reward_id: Option<String>,
}

/// Partial update for link options. `None` means "leave unchanged" — an
/// explicit contract, not a falsiness convention.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkPatch {
    pub usage_limit: Option<u32>,
    pub validity_secs: Option<u64>,
}

impl LinkPatch {
    pub fn is_empty(&self) -> bool {
        self.usage_limit.is_none() && self.validity_secs.is_none()
    }
}

/// Collection of [`Link`] rows, keyed by canonical channel name.
pub struct LinkStore {
    db: Arc<Database>,
}

impl LinkStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new link. Fails with [`StoreError::AlreadyExists`] when the
    /// channel is already linked, to any guild.
    pub async fn create(&self, link: Link) -> Result<(), StoreError> {
        let key = link.channel.as_str().to_string();
        self.db
            .mutate(|c| {
                if c.links.contains_key(&key) {
                    return Err(StoreError::AlreadyExists(key.clone()));
                }
                c.links.insert(key.clone(), link);
                Ok(())
            })
            .await
    }

    pub async fn get(&self, channel: &ChannelName) -> Result<Option<Link>, StoreError> {
        Ok(self.db.read(|c| c.links.get(channel.as_str()).cloned()).await)
    }

    /// Apply a partial options update, matching channel and guild
    /// atomically. Returns whether a row matched.
    pub async fn update_options(
        &self,
        channel: &ChannelName,
        guild_id: &str,
        patch: LinkPatch,
    ) -> Result<bool, StoreError> {
        let key = channel.as_str().to_string();
        let guild_id = guild_id.to_string();
        self.db
            .mutate(|c| {
                let link = match c.links.get_mut(&key) {
                    Some(link) if link.guild_id == guild_id => link,
                    _ => return Ok(false),
                };
                if let Some(usage_limit) = patch.usage_limit {
                    link.options.usage_limit = usage_limit;
                }
                if let Some(validity_secs) = patch.validity_secs {
                    link.options.validity_secs = validity_secs;
                }
                Ok(true)
            })
            .await
    }

    /// Record (or clear) the external reward id on an existing link.
    pub async fn set_reward(
        &self,
        channel: &ChannelName,
        reward_id: Option<String>,
    ) -> Result<bool, StoreError> {
        let key = channel.as_str().to_string();
        self.db
            .mutate(|c| match c.links.get_mut(&key) {
                Some(link) => {
                    link.reward_id = reward_id;
                    Ok(true)
                }
                None => Ok(false),
            })
            .await
    }

    pub async fn channels_for_guild(&self, guild_id: &str) -> Result<Vec<ChannelName>, StoreError> {
        Ok(self
            .db
            .read(|c| {
                c.links
                    .values()
                    .filter(|link| link.guild_id == guild_id)
                    .map(|link| link.channel.clone())
                    .collect()
            })
            .await)
    }

    /// Channels the chat bot should be joined to (Chat or Both mode).
    pub async fn chat_channels(&self) -> Result<Vec<ChannelName>, StoreError> {
        Ok(self
            .db
            .read(|c| {
                c.links
                    .values()
                    .filter(|link| link.options.mode.includes_chat())
                    .map(|link| link.channel.clone())
                    .collect()
            })
            .await)
    }

    /// Remove one link. When `guild_id` is given, the row must match both
    /// fields to be removed — an operator on guild A can never delete
    /// guild B's link. Returns whether a row was removed; transport
    /// failures surface as `Err`.
    pub async fn remove(
        &self,
        channel: &ChannelName,
        guild_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let key = channel.as_str().to_string();
        let guild_id = guild_id.map(str::to_string);
        self.db
            .mutate(|c| {
                let matches = match (c.links.get(&key), &guild_id) {
                    (Some(link), Some(guild)) => link.guild_id == *guild,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if !matches {
                    return Ok(false);
                }
                c.links.remove(&key);
                Ok(true)
            })
            .await
    }

    /// Remove every link for a guild in one batch, returning the removed
    /// rows so the caller can run their side effects.
    pub async fn remove_guild(&self, guild_id: &str) -> Result<Vec<Link>, StoreError> {
        let guild_id = guild_id.to_string();
        self.db
            .mutate(|c| {
                let keys: Vec<String> = c
                    .links
                    .iter()
                    .filter(|(_, link)| link.guild_id == guild_id)
                    .map(|(key, _)| key.clone())
                    .collect();
                let mut removed = Vec::with_capacity(keys.len());
                for key in keys {
                    if let Some(link) = c.links.remove(&key) {
                        removed.push(link);
                    }
                }
                Ok(removed)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(channel: &str, guild: &str, mode: RedemptionMode) -> Link {
        Link {
            channel: ChannelName::new(channel),
            guild_id: guild.to_string(),
            options: LinkOptions {
                usage_limit: 1,
                validity_secs: 900,
                mode,
            },
            reward_id: None,
        }
    }

    fn store() -> LinkStore {
        LinkStore::new(Database::in_memory())
    }

    #[tokio::test]
    async fn duplicate_create_is_a_distinct_error() {
        let links = store();
        links.create(link("#demo", "g1", RedemptionMode::Chat)).await.unwrap();
        let err = links
            .create(link("#Demo", "g2", RedemptionMode::Both))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn remove_scoped_by_guild_matches_both_fields() {
        let links = store();
        links.create(link("#demo", "g1", RedemptionMode::Chat)).await.unwrap();

        // Wrong guild: no match, not an error.
        assert!(!links
            .remove(&ChannelName::new("#demo"), Some("g2"))
            .await
            .unwrap());
        assert!(links.get(&ChannelName::new("#demo")).await.unwrap().is_some());

        assert!(links
            .remove(&ChannelName::new("#demo"), Some("g1"))
            .await
            .unwrap());
        assert!(links.get(&ChannelName::new("#demo")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_unknown_channel_reports_no_match() {
        let links = store();
        assert!(!links.remove(&ChannelName::new("#ghost"), None).await.unwrap());
    }

    #[tokio::test]
    async fn patch_updates_fields_independently() {
        let links = store();
        links.create(link("#demo", "g1", RedemptionMode::Chat)).await.unwrap();

        let patched = links
            .update_options(
                &ChannelName::new("#demo"),
                "g1",
                LinkPatch {
                    usage_limit: Some(5),
                    validity_secs: None,
                },
            )
            .await
            .unwrap();
        assert!(patched);

        let row = links.get(&ChannelName::new("#demo")).await.unwrap().unwrap();
        assert_eq!(row.options.usage_limit, 5);
        assert_eq!(row.options.validity_secs, 900, "unset field must not change");
    }

    #[tokio::test]
    async fn guild_cascade_returns_all_removed_rows() {
        let links = store();
        links.create(link("#a", "g1", RedemptionMode::Chat)).await.unwrap();
        links.create(link("#b", "g1", RedemptionMode::Both)).await.unwrap();
        links.create(link("#c", "g2", RedemptionMode::Chat)).await.unwrap();

        let removed = links.remove_guild("g1").await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(links.get(&ChannelName::new("#a")).await.unwrap().is_none());
        assert!(links.get(&ChannelName::new("#c")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn chat_channels_excludes_channel_points_only() {
        let links = store();
        links.create(link("#a", "g1", RedemptionMode::Chat)).await.unwrap();
        links.create(link("#b", "g1", RedemptionMode::ChannelPoints)).await.unwrap();
        links.create(link("#c", "g1", RedemptionMode::Both)).await.unwrap();

        let mut channels = links.chat_channels().await.unwrap();
        channels.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(
            channels,
            vec![ChannelName::new("#a"), ChannelName::new("#c")]
        );
    }

    #[test]
    fn mode_flags() {
        assert_eq!(RedemptionMode::from_flags(true, true), Some(RedemptionMode::Both));
        assert_eq!(RedemptionMode::from_flags(true, false), Some(RedemptionMode::Chat));
        assert_eq!(
            RedemptionMode::from_flags(false, true),
            Some(RedemptionMode::ChannelPoints)
        );
        assert_eq!(RedemptionMode::from_flags(false, false), None);
    }
}
