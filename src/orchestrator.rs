use std::sync::Arc;

use tracing::{error, info, warn};

use crate::adapters::{ChatHandle, GuildHandle, InviteArtifact, InviteSpec, RewardHandle};
use crate::channel::ChannelName;
use crate::error::{Result, UsherError};
use crate::store::{
    InviteRecordStore, Link, LinkOptions, LinkPatch, LinkStore, RedemptionMode, StoreError,
};

/// Defaults applied when a link or invite command omits its limits.
pub const DEFAULT_USAGE_LIMIT: u32 = 1;
pub const DEFAULT_VALIDITY_SECS: u64 = 60 * 15;

/// What an operator asked for when linking a channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkRequest {
    pub chat: bool,
    pub channel_points: bool,
    pub usage_limit: Option<u32>,
    pub validity_secs: Option<u64>,
}

/// Who is asking for an invite, for entitlement purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redeemer {
    /// The channel owner; always entitled.
    Broadcaster,
    /// A channel moderator going through chat.
    Moderator,
    /// Anyone else going through chat.
    Viewer,
    /// A paid channel-point redemption.
    ChannelPoints,
}

/// Cleanup outcome of an unlink. The row is gone either way; failures here
/// are side effects an operator may need to finish by hand.
#[derive(Debug, Default)]
pub struct UnlinkReport {
    pub cleanup_failures: Vec<String>,
}

/// Core business logic: drives each channel through
/// `Unlinked → Linked(mode) → Unlinked` and issues or revokes invitation
/// artifacts. Platform-free; everything external goes through the three
/// boundary traits.
pub struct InviteOrchestrator {
    links: Arc<LinkStore>,
    invites: Arc<InviteRecordStore>,
    chat: Arc<dyn ChatHandle>,
    guilds: Arc<dyn GuildHandle>,
    rewards: Arc<dyn RewardHandle>,
}

impl InviteOrchestrator {
    pub fn new(
        links: Arc<LinkStore>,
        invites: Arc<InviteRecordStore>,
        chat: Arc<dyn ChatHandle>,
        guilds: Arc<dyn GuildHandle>,
        rewards: Arc<dyn RewardHandle>,
    ) -> Self {
        Self {
            links,
            invites,
            chat,
            guilds,
            rewards,
        }
    }

    /// Link a channel to a guild. Joins chat and/or creates the paid
    /// reward according to the requested mode. If reward creation fails
    /// the whole link is rolled back — a Both-mode row without a reward id
    /// would silently behave like plain Chat mode.
    pub async fn link(
        &self,
        guild_id: &str,
        channel: &ChannelName,
        request: LinkRequest,
    ) -> Result<Link> {
        if channel.is_empty() {
            return Err(UsherError::validation("no channel provided."));
        }
        let mode = RedemptionMode::from_flags(request.chat, request.channel_points).ok_or_else(
            || UsherError::validation("you need to provide at least \"-c\" or \"-cp\" or both."),
        )?;
        let usage_limit = request.usage_limit.unwrap_or(DEFAULT_USAGE_LIMIT);
        if usage_limit < 1 {
            return Err(UsherError::validation("usages must be at least 1."));
        }

        let mut link = Link {
            channel: channel.clone(),
            guild_id: guild_id.to_string(),
            options: LinkOptions {
                usage_limit,
                validity_secs: request.validity_secs.unwrap_or(DEFAULT_VALIDITY_SECS),
                mode,
            },
            reward_id: None,
        };

        match self.links.create(link.clone()).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(_)) => {
                return Err(UsherError::conflict(format!(
                    "invites are already enabled for {channel}."
                )))
            }
            Err(err) => return Err(err.into()),
        }

        if mode.includes_chat() {
            // A failed join leaves the link functional for channel points
            // and is healed by the startup presence sync.
            if let Err(err) = self.chat.join(channel).await {
                warn!(channel = %channel, error = %err, "Failed to join chat channel");
            }
        }

        if mode.includes_channel_points() {
            let reward_id = match self.rewards.create_reward(channel).await {
                Ok(reward_id) => reward_id,
                Err(err) => {
                    error!(channel = %channel, error = %err, "Reward creation failed, rolling the link back");
                    self.roll_back_link(channel, guild_id, mode).await;
                    return Err(UsherError::upstream(format!(
                        "reward creation for {channel} failed: {err}"
                    )));
                }
            };
            match self.links.set_reward(channel, Some(reward_id.clone())).await {
                Ok(true) => link.reward_id = Some(reward_id),
                Ok(false) | Err(_) => {
                    error!(channel = %channel, "Could not record reward id, rolling the link back");
                    if let Err(err) = self.rewards.delete_reward(channel, &reward_id).await {
                        warn!(channel = %channel, error = %err, "Orphaned reward could not be deleted");
                    }
                    self.roll_back_link(channel, guild_id, mode).await;
                    return Err(UsherError::Persistence(format!(
                        "could not record reward id for {channel}"
                    )));
                }
            }
        }

        info!(channel = %channel, guild = guild_id, mode = mode.describe(), "Channel linked");
        Ok(link)
    }

    async fn roll_back_link(&self, channel: &ChannelName, guild_id: &str, mode: RedemptionMode) {
        if let Err(err) = self.links.remove(channel, Some(guild_id)).await {
            error!(channel = %channel, error = %err, "Rollback could not remove the link row");
        }
        if mode.includes_chat() {
            if let Err(err) = self.chat.part(channel).await {
                warn!(channel = %channel, error = %err, "Rollback could not leave the chat channel");
            }
        }
    }

    /// Partial options update. Fields left `None` stay untouched.
    pub async fn update(
        &self,
        guild_id: &str,
        channel: &ChannelName,
        patch: LinkPatch,
    ) -> Result<()> {
        if let Some(usage_limit) = patch.usage_limit {
            if usage_limit < 1 {
                return Err(UsherError::validation("usages must be at least 1."));
            }
        }
        if self.links.update_options(channel, guild_id, patch).await? {
            info!(channel = %channel, guild = guild_id, "Link options updated");
            Ok(())
        } else {
            Err(UsherError::not_found(format!(
                "couldn't find the channel {channel} on this server."
            )))
        }
    }

    /// The link for a channel, scoped to a guild when the caller acts on
    /// behalf of one.
    pub async fn link_info(&self, guild_id: &str, channel: &ChannelName) -> Result<Link> {
        match self.links.get(channel).await? {
            Some(link) if link.guild_id == guild_id => Ok(link),
            _ => Err(UsherError::not_found(format!(
                "couldn't find the channel {channel} on this server."
            ))),
        }
    }

    pub async fn list(&self, guild_id: &str) -> Result<Vec<ChannelName>> {
        Ok(self.links.channels_for_guild(guild_id).await?)
    }

    /// Unlink a channel. The row removal is the one thing that must
    /// succeed; leaving chat and deleting the reward are each attempted
    /// and reported, never blocking each other or the removal. A stuck
    /// row would block re-linking, a dangling reward is fixable by hand.
    pub async fn unlink(
        &self,
        guild_id: Option<&str>,
        channel: &ChannelName,
    ) -> Result<UnlinkReport> {
        let link = match self.links.get(channel).await? {
            Some(link) => link,
            None => {
                return Err(UsherError::not_found(format!(
                    "no invites are configured for {channel}."
                )))
            }
        };
        if !self.links.remove(channel, guild_id).await? {
            return Err(UsherError::not_found(format!(
                "no invites are configured for {channel} on this server."
            )));
        }

        let report = self.run_teardown_effects(&link).await;
        info!(channel = %channel, "Channel unlinked");
        Ok(report)
    }

    async fn run_teardown_effects(&self, link: &Link) -> UnlinkReport {
        let mut report = UnlinkReport::default();
        if link.options.mode.includes_chat() {
            if let Err(err) = self.chat.part(&link.channel).await {
                warn!(channel = %link.channel, error = %err, "Failed to leave chat channel");
                report
                    .cleanup_failures
                    .push("leaving the chat channel failed".to_string());
            }
        }
        if let Some(reward_id) = &link.reward_id {
            if let Err(err) = self.rewards.delete_reward(&link.channel, reward_id).await {
                warn!(channel = %link.channel, error = %err, "Failed to delete reward");
                report
                    .cleanup_failures
                    .push("deleting the channel point reward failed".to_string());
            }
        }
        report
    }

    /// Cascade for a guild the bot was removed from: every link goes in
    /// one batch, then each channel's teardown effects run best-effort.
    pub async fn guild_removed(&self, guild_id: &str) -> Result<Vec<ChannelName>> {
        let removed = self.links.remove_guild(guild_id).await?;
        let mut channels = Vec::with_capacity(removed.len());
        for link in &removed {
            self.run_teardown_effects(link).await;
            channels.push(link.channel.clone());
        }
        info!(guild = guild_id, count = channels.len(), "Guild links removed");
        Ok(channels)
    }

    /// Issue a single-use invite for a channel's guild and record it as
    /// the channel's current invite. Returns the artifact whose URL the
    /// adapter delivers privately to the redeemer.
    pub async fn issue_invite(
        &self,
        channel: &ChannelName,
        redeemer: Redeemer,
        overrides: LinkPatch,
    ) -> Result<InviteArtifact> {
        let link = match self.links.get(channel).await? {
            Some(link) => link,
            None => {
                return Err(UsherError::not_found(format!(
                    "no invites are configured for {channel}."
                )))
            }
        };

        match redeemer {
            Redeemer::Broadcaster => {}
            Redeemer::Moderator if link.options.mode.includes_chat() => {}
            Redeemer::ChannelPoints if link.options.mode.includes_channel_points() => {}
            Redeemer::Moderator => {
                return Err(UsherError::permission(format!(
                    "invites over chat are not enabled for {channel}."
                )))
            }
            Redeemer::ChannelPoints => {
                return Err(UsherError::permission(format!(
                    "invites over channel points are not enabled for {channel}."
                )))
            }
            Redeemer::Viewer => {
                return Err(UsherError::permission(
                    "only the broadcaster and moderators can request invites.",
                ))
            }
        }

        let spec = InviteSpec {
            max_uses: overrides.usage_limit.unwrap_or(link.options.usage_limit),
            max_age_secs: overrides.validity_secs.unwrap_or(link.options.validity_secs),
        };
        let artifact = self
            .guilds
            .create_invite(&link.guild_id, spec)
            .await
            .map_err(|err| UsherError::upstream(format!("invite creation failed: {err}")))?;

        // Losing the record costs a later purge, not the delivery itself.
        if let Err(err) = self.invites.set_last(channel, &artifact.code).await {
            error!(channel = %channel, error = %err, "Failed to record issued invite");
        }
        info!(channel = %channel, code = %artifact.code, "Invite issued");
        Ok(artifact)
    }

    /// Revoke the channel's recorded invite. Returns whether there was
    /// one; the artifact must be gone before the record is dropped.
    pub async fn purge(&self, channel: &ChannelName) -> Result<bool> {
        let code = match self.invites.last(channel).await? {
            Some(code) => code,
            None => return Ok(false),
        };
        self.guilds
            .delete_invite(&code)
            .await
            .map_err(|err| UsherError::upstream(format!("invite deletion failed: {err}")))?;
        self.invites.remove(channel).await?;
        info!(channel = %channel, code = %code, "Invite purged");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockChat {
        joins: Mutex<Vec<String>>,
        parts: Mutex<Vec<String>>,
        fail_part: AtomicBool,
    }

    #[async_trait]
    impl ChatHandle for MockChat {
        async fn join(&self, channel: &ChannelName) -> anyhow::Result<()> {
            self.joins.lock().unwrap().push(channel.as_str().to_string());
            Ok(())
        }

        async fn part(&self, channel: &ChannelName) -> anyhow::Result<()> {
            self.parts.lock().unwrap().push(channel.as_str().to_string());
            if self.fail_part.load(Ordering::SeqCst) {
                anyhow::bail!("connection lost");
            }
            Ok(())
        }

        async fn say(&self, _channel: &ChannelName, _message: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn whisper(&self, _username: &str, _message: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockGuilds {
        created: Mutex<Vec<(String, InviteSpec)>>,
        deleted: Mutex<Vec<String>>,
        fail_delete: AtomicBool,
        counter: AtomicUsize,
    }

    #[async_trait]
    impl GuildHandle for MockGuilds {
        async fn create_invite(
            &self,
            guild_id: &str,
            spec: InviteSpec,
        ) -> anyhow::Result<InviteArtifact> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            self.created.lock().unwrap().push((guild_id.to_string(), spec));
            Ok(InviteArtifact {
                code: format!("code{n}"),
                url: format!("https://invite.example/code{n}"),
            })
        }

        async fn delete_invite(&self, code: &str) -> anyhow::Result<()> {
            if self.fail_delete.load(Ordering::SeqCst) {
                anyhow::bail!("api unavailable");
            }
            self.deleted.lock().unwrap().push(code.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockRewards {
        created: Mutex<Vec<String>>,
        deleted: Mutex<Vec<String>>,
        fail_create: AtomicBool,
    }

    #[async_trait]
    impl RewardHandle for MockRewards {
        async fn create_reward(&self, channel: &ChannelName) -> anyhow::Result<String> {
            if self.fail_create.load(Ordering::SeqCst) {
                anyhow::bail!("helix rejected the reward");
            }
            self.created.lock().unwrap().push(channel.as_str().to_string());
            Ok("reward-1".to_string())
        }

        async fn delete_reward(&self, _channel: &ChannelName, reward_id: &str) -> anyhow::Result<()> {
            self.deleted.lock().unwrap().push(reward_id.to_string());
            Ok(())
        }
    }

    struct Fixture {
        orchestrator: InviteOrchestrator,
        links: Arc<LinkStore>,
        invites: Arc<InviteRecordStore>,
        chat: Arc<MockChat>,
        guilds: Arc<MockGuilds>,
        rewards: Arc<MockRewards>,
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory();
        let links = Arc::new(LinkStore::new(db.clone()));
        let invites = Arc::new(InviteRecordStore::new(db));
        let chat = Arc::new(MockChat::default());
        let guilds = Arc::new(MockGuilds::default());
        let rewards = Arc::new(MockRewards::default());
        let orchestrator = InviteOrchestrator::new(
            links.clone(),
            invites.clone(),
            chat.clone(),
            guilds.clone(),
            rewards.clone(),
        );
        Fixture {
            orchestrator,
            links,
            invites,
            chat,
            guilds,
            rewards,
        }
    }

    fn chat_request() -> LinkRequest {
        LinkRequest {
            chat: true,
            ..LinkRequest::default()
        }
    }

    #[tokio::test]
    async fn link_joins_chat_and_applies_defaults() {
        let f = fixture();
        let channel = ChannelName::new("#demo");
        let link = f.orchestrator.link("g1", &channel, chat_request()).await.unwrap();

        assert_eq!(link.options.usage_limit, DEFAULT_USAGE_LIMIT);
        assert_eq!(link.options.validity_secs, DEFAULT_VALIDITY_SECS);
        assert_eq!(link.options.mode, RedemptionMode::Chat);
        assert_eq!(*f.chat.joins.lock().unwrap(), vec!["#demo"]);
    }

    #[tokio::test]
    async fn second_link_conflicts_without_a_second_join() {
        let f = fixture();
        let channel = ChannelName::new("#demo");
        f.orchestrator.link("g1", &channel, chat_request()).await.unwrap();

        let err = f
            .orchestrator
            .link("g1", &channel, chat_request())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(f.chat.joins.lock().unwrap().len(), 1);
        assert_eq!(f.links.channels_for_guild("g1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn link_without_mode_flags_is_rejected() {
        let f = fixture();
        let err = f
            .orchestrator
            .link("g1", &ChannelName::new("#demo"), LinkRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, UsherError::Validation(_)));
    }

    #[tokio::test]
    async fn reward_failure_rolls_the_link_back() {
        let f = fixture();
        f.rewards.fail_create.store(true, Ordering::SeqCst);
        let channel = ChannelName::new("#demo");

        let err = f
            .orchestrator
            .link(
                "g1",
                &channel,
                LinkRequest {
                    chat: true,
                    channel_points: true,
                    ..LinkRequest::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_internal());

        assert!(f.links.get(&channel).await.unwrap().is_none(), "row rolled back");
        assert_eq!(*f.chat.parts.lock().unwrap(), vec!["#demo"], "join reverted");
    }

    #[tokio::test]
    async fn channel_points_link_records_the_reward() {
        let f = fixture();
        let channel = ChannelName::new("#demo");
        let link = f
            .orchestrator
            .link(
                "g1",
                &channel,
                LinkRequest {
                    channel_points: true,
                    ..LinkRequest::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(link.reward_id.as_deref(), Some("reward-1"));
        assert!(f.chat.joins.lock().unwrap().is_empty(), "no chat mode, no join");
        let stored = f.links.get(&channel).await.unwrap().unwrap();
        assert_eq!(stored.reward_id.as_deref(), Some("reward-1"));
    }

    #[tokio::test]
    async fn update_changes_only_the_given_fields() {
        let f = fixture();
        let channel = ChannelName::new("#demo");
        f.orchestrator.link("g1", &channel, chat_request()).await.unwrap();

        f.orchestrator
            .update(
                "g1",
                &channel,
                LinkPatch {
                    usage_limit: Some(5),
                    validity_secs: None,
                },
            )
            .await
            .unwrap();

        let link = f.links.get(&channel).await.unwrap().unwrap();
        assert_eq!(link.options.usage_limit, 5);
        assert_eq!(link.options.validity_secs, DEFAULT_VALIDITY_SECS);
    }

    #[tokio::test]
    async fn update_unknown_channel_is_not_found() {
        let f = fixture();
        let err = f
            .orchestrator
            .update("g1", &ChannelName::new("#ghost"), LinkPatch::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn unlink_never_linked_channel_is_not_found() {
        let f = fixture();
        let err = f
            .orchestrator
            .unlink(Some("g1"), &ChannelName::new("#ghost"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn unlink_cleanup_is_best_effort() {
        let f = fixture();
        let channel = ChannelName::new("#demo");
        f.orchestrator
            .link(
                "g1",
                &channel,
                LinkRequest {
                    chat: true,
                    channel_points: true,
                    ..LinkRequest::default()
                },
            )
            .await
            .unwrap();
        f.chat.fail_part.store(true, Ordering::SeqCst);

        let report = f.orchestrator.unlink(Some("g1"), &channel).await.unwrap();

        assert!(f.links.get(&channel).await.unwrap().is_none(), "row removed");
        assert_eq!(
            *f.rewards.deleted.lock().unwrap(),
            vec!["reward-1"],
            "reward deletion still attempted after the part failed"
        );
        assert_eq!(report.cleanup_failures.len(), 1);
    }

    #[tokio::test]
    async fn guild_cascade_attempts_every_leave() {
        let f = fixture();
        for name in ["#a", "#b", "#c"] {
            f.orchestrator
                .link("g1", &ChannelName::new(name), chat_request())
                .await
                .unwrap();
        }
        f.chat.fail_part.store(true, Ordering::SeqCst);

        let removed = f.orchestrator.guild_removed("g1").await.unwrap();
        assert_eq!(removed.len(), 3);
        assert_eq!(f.chat.parts.lock().unwrap().len(), 3, "every leave attempted");
        assert!(f.links.channels_for_guild("g1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn viewer_invite_on_unlinked_channel_creates_nothing() {
        let f = fixture();
        let err = f
            .orchestrator
            .issue_invite(&ChannelName::new("#demo"), Redeemer::Viewer, LinkPatch::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(f.guilds.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn viewer_invite_on_linked_channel_is_denied() {
        let f = fixture();
        let channel = ChannelName::new("#demo");
        f.orchestrator.link("g1", &channel, chat_request()).await.unwrap();

        let err = f
            .orchestrator
            .issue_invite(&channel, Redeemer::Viewer, LinkPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, UsherError::Permission(_)));
        assert!(f.guilds.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn moderator_invite_needs_chat_mode() {
        let f = fixture();
        let channel = ChannelName::new("#demo");
        f.orchestrator
            .link(
                "g1",
                &channel,
                LinkRequest {
                    channel_points: true,
                    ..LinkRequest::default()
                },
            )
            .await
            .unwrap();

        let err = f
            .orchestrator
            .issue_invite(&channel, Redeemer::Moderator, LinkPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, UsherError::Permission(_)));

        // The broadcaster is entitled regardless of mode.
        f.orchestrator
            .issue_invite(&channel, Redeemer::Broadcaster, LinkPatch::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn issued_invite_uses_link_limits_and_overrides() {
        let f = fixture();
        let channel = ChannelName::new("#demo");
        f.orchestrator
            .link(
                "g1",
                &channel,
                LinkRequest {
                    chat: true,
                    usage_limit: Some(3),
                    validity_secs: Some(600),
                    ..LinkRequest::default()
                },
            )
            .await
            .unwrap();

        f.orchestrator
            .issue_invite(&channel, Redeemer::Moderator, LinkPatch::default())
            .await
            .unwrap();
        f.orchestrator
            .issue_invite(
                &channel,
                Redeemer::Broadcaster,
                LinkPatch {
                    usage_limit: Some(10),
                    validity_secs: None,
                },
            )
            .await
            .unwrap();

        let created = f.guilds.created.lock().unwrap();
        assert_eq!(created[0].1, InviteSpec { max_uses: 3, max_age_secs: 600 });
        assert_eq!(created[1].1, InviteSpec { max_uses: 10, max_age_secs: 600 });
        drop(created);

        // The record tracks the latest artifact.
        assert_eq!(f.invites.last(&channel).await.unwrap().as_deref(), Some("code1"));
    }

    #[tokio::test]
    async fn purge_without_record_is_a_reported_noop() {
        let f = fixture();
        assert!(!f.orchestrator.purge(&ChannelName::new("#demo")).await.unwrap());
    }

    #[tokio::test]
    async fn purge_deletes_artifact_then_record() {
        let f = fixture();
        let channel = ChannelName::new("#demo");
        f.orchestrator.link("g1", &channel, chat_request()).await.unwrap();
        f.orchestrator
            .issue_invite(&channel, Redeemer::Broadcaster, LinkPatch::default())
            .await
            .unwrap();

        assert!(f.orchestrator.purge(&channel).await.unwrap());
        assert_eq!(*f.guilds.deleted.lock().unwrap(), vec!["code0"]);
        assert_eq!(f.invites.last(&channel).await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_artifact_deletion_keeps_the_record() {
        let f = fixture();
        let channel = ChannelName::new("#demo");
        f.orchestrator.link("g1", &channel, chat_request()).await.unwrap();
        f.orchestrator
            .issue_invite(&channel, Redeemer::Broadcaster, LinkPatch::default())
            .await
            .unwrap();
        f.guilds.fail_delete.store(true, Ordering::SeqCst);

        assert!(f.orchestrator.purge(&channel).await.is_err());
        assert!(f.invites.last(&channel).await.unwrap().is_some(), "retryable");
    }
}
