//! Streaming-side adapter: viewer-facing commands riding on the chat
//! connection, plus the channel-point redemption entry point.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{error, info};

use super::twitch_chat::ChatMessage;
use super::ChatHandle;
use crate::channel::ChannelName;
use crate::error::{Result, UsherError};
use crate::orchestrator::{InviteOrchestrator, Redeemer};
use crate::router::{CommandContext, CommandRouter, DuplicateCommandError};
use crate::store::LinkPatch;

/// Sender context for one chat message.
pub struct TwitchContext {
    pub channel: ChannelName,
    pub username: String,
    pub is_moderator: bool,
    chat: Arc<dyn ChatHandle>,
}

#[async_trait]
impl CommandContext for TwitchContext {
    async fn reply(&self, text: &str) {
        let line = format!("@{}, {text}", self.username);
        if let Err(err) = self.chat.say(&self.channel, &line).await {
            error!(channel = %self.channel, error = %err, "Reply failed");
        }
    }
}

impl TwitchContext {
    pub fn is_broadcaster(&self) -> bool {
        self.channel.is_broadcaster(&self.username)
    }

    fn redeemer(&self) -> Redeemer {
        if self.is_broadcaster() {
            Redeemer::Broadcaster
        } else if self.is_moderator {
            Redeemer::Moderator
        } else {
            Redeemer::Viewer
        }
    }
}

pub struct TwitchAdapter {
    orchestrator: Arc<InviteOrchestrator>,
    chat: Arc<dyn ChatHandle>,
}

impl TwitchAdapter {
    pub fn new(orchestrator: Arc<InviteOrchestrator>, chat: Arc<dyn ChatHandle>) -> Self {
        Self { orchestrator, chat }
    }

    fn context(&self, message: &ChatMessage) -> TwitchContext {
        TwitchContext {
            channel: message.channel.clone(),
            username: message.username.clone(),
            is_moderator: message.is_moderator,
            chat: self.chat.clone(),
        }
    }

    /// The `@user [usages] [ageMinutes]` form, reached through the router
    /// fallback: issue an invite and whisper it to the target user.
    async fn cmd_invite(&self, ctx: Arc<TwitchContext>, args: Vec<String>) -> Result<()> {
        let Some(target) = args.first() else {
            return Err(UsherError::validation("no user provided."));
        };
        let Some(username) = target.strip_prefix('@') else {
            // Not the invite form; same wording as an unknown command.
            ctx.reply(&format!("there is no command {target}!")).await;
            return Ok(());
        };
        let username = username.to_lowercase();
        if username.is_empty() {
            return Err(UsherError::validation("no user provided."));
        }
        let overrides = parse_invite_overrides(&args[1..])?;

        let artifact = self
            .orchestrator
            .issue_invite(&ctx.channel, ctx.redeemer(), overrides)
            .await?;
        self.chat
            .whisper(&username, &format!("here is your invite: {}", artifact.url))
            .await
            .map_err(|err| UsherError::upstream(format!("whisper failed: {err}")))?;
        ctx.reply(&format!("I've whispered an invite to @{username}."))
            .await;
        Ok(())
    }

    /// Broadcaster-initiated unlink from inside the chat channel.
    async fn cmd_leave(&self, ctx: Arc<TwitchContext>, _args: Vec<String>) -> Result<()> {
        if !ctx.is_broadcaster() {
            return Err(UsherError::permission(
                "only the broadcaster can send me away.",
            ));
        }
        self.orchestrator.unlink(None, &ctx.channel).await?;
        ctx.reply("invites are off now. Bye!").await;
        Ok(())
    }

    /// Revoke the channel's last issued invite.
    async fn cmd_purge(&self, ctx: Arc<TwitchContext>, _args: Vec<String>) -> Result<()> {
        if !ctx.is_broadcaster() && !ctx.is_moderator {
            return Err(UsherError::permission(
                "only the broadcaster and moderators can revoke invites.",
            ));
        }
        if self.orchestrator.purge(&ctx.channel).await? {
            ctx.reply("the last invite is revoked.").await;
        } else {
            ctx.reply("there is no invite to revoke.").await;
        }
        Ok(())
    }

    /// Entry point for paid channel-point redemptions, called by whatever
    /// delivers redemption events for the channel.
    pub async fn handle_redemption(&self, channel: &ChannelName, username: &str) {
        let username = username.to_lowercase();
        match self
            .orchestrator
            .issue_invite(channel, Redeemer::ChannelPoints, LinkPatch::default())
            .await
        {
            Ok(artifact) => {
                info!(channel = %channel, user = %username, "Redemption fulfilled");
                if let Err(err) = self
                    .chat
                    .whisper(&username, &format!("here is your invite: {}", artifact.url))
                    .await
                {
                    error!(channel = %channel, error = %err, "Redemption whisper failed");
                }
            }
            Err(err) => {
                error!(channel = %channel, user = %username, error = %err, "Redemption failed")
            }
        }
    }
}

type Handler =
    Box<dyn Fn(Arc<TwitchContext>, Vec<String>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

fn handler<F>(adapter: &Arc<TwitchAdapter>, method: F) -> Handler
where
    F: Fn(Arc<TwitchAdapter>, Arc<TwitchContext>, Vec<String>) -> BoxFuture<'static, Result<()>>
        + Send
        + Sync
        + 'static,
{
    let adapter = adapter.clone();
    Box::new(move |ctx, args| method(adapter.clone(), ctx, args))
}

/// Build the streaming-side router: `leave`, `purge`, and the `@user`
/// invite form as the fallback.
pub fn build_router(
    adapter: &Arc<TwitchAdapter>,
    prefix: &str,
) -> std::result::Result<CommandRouter<TwitchContext>, DuplicateCommandError> {
    let mut router = CommandRouter::new(prefix);
    router.register("leave", handler(adapter, |a, c, args| {
        Box::pin(async move { a.cmd_leave(c, args).await })
    }))?;
    router.register("purge", handler(adapter, |a, c, args| {
        Box::pin(async move { a.cmd_purge(c, args).await })
    }))?;
    router.set_fallback(handler(adapter, |a, c, args| {
        Box::pin(async move { a.cmd_invite(c, args).await })
    }));
    Ok(router)
}

/// Consume inbound chat messages, one spawned dispatch each.
pub fn spawn_message_loop(
    adapter: Arc<TwitchAdapter>,
    router: Arc<CommandRouter<TwitchContext>>,
    mut messages: mpsc::Receiver<ChatMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            let ctx = Arc::new(adapter.context(&message));
            let router = router.clone();
            tokio::spawn(async move {
                router.dispatch(&message.text, ctx).await;
            });
        }
    })
}

fn parse_invite_overrides(args: &[String]) -> Result<LinkPatch> {
    let usage_limit = match args.first() {
        Some(value) => Some(
            value
                .parse::<u32>()
                .map_err(|_| UsherError::validation("usages must be a number."))?,
        ),
        None => None,
    };
    let validity_secs = match args.get(1) {
        Some(value) => Some(
            value
                .parse::<u64>()
                .map_err(|_| UsherError::validation("time must be a number of minutes."))?
                * 60,
        ),
        None => None,
    };
    Ok(LinkPatch {
        usage_limit,
        validity_secs,
    })
}
