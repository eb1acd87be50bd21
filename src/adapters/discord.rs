//! Messaging-side adapter: turns gateway events into orchestrator calls
//! and registers the operator command surface.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::discord_gateway::GatewayEvent;
use super::discord_rest::DiscordRestClient;
use crate::auth::{AuthSessions, OAuthClient};
use crate::channel::ChannelName;
use crate::error::{Result, UsherError};
use crate::orchestrator::{InviteOrchestrator, LinkRequest};
use crate::router::{CommandContext, CommandRouter, DuplicateCommandError};
use crate::store::{GuildStore, LinkPatch};

/// Sender context for one guild message.
pub struct DiscordContext {
    pub guild_id: String,
    pub channel_id: String,
    pub author_id: String,
    pub member_roles: Vec<String>,
    pub mention_roles: Vec<String>,
    rest: Arc<DiscordRestClient>,
}

#[async_trait]
impl CommandContext for DiscordContext {
    async fn reply(&self, text: &str) {
        let content = format!("<@{}> {text}", self.author_id);
        if let Err(err) = self.rest.send_message(&self.channel_id, &content).await {
            error!(channel = %self.channel_id, error = %err, "Reply failed");
        }
    }
}

impl DiscordContext {
    /// Guild owner or holder of a role with the administrator bit.
    pub async fn is_admin(&self) -> bool {
        match self.rest.guild(&self.guild_id).await {
            Ok(guild) if guild.owner_id == self.author_id => return true,
            Ok(_) => {}
            Err(err) => {
                warn!(guild = %self.guild_id, error = %err, "Guild lookup failed");
                return false;
            }
        }
        match self.rest.guild_roles(&self.guild_id).await {
            Ok(roles) => roles
                .iter()
                .any(|role| role.is_administrator() && self.member_roles.contains(&role.id)),
            Err(err) => {
                warn!(guild = %self.guild_id, error = %err, "Role lookup failed");
                false
            }
        }
    }

    pub async fn is_admin_or_has_role(&self, edit_role: Option<&str>) -> bool {
        if let Some(role) = edit_role {
            if self.member_roles.iter().any(|held| held == role) {
                return true;
            }
        }
        self.is_admin().await
    }
}

/// The operator command surface plus the guild lifecycle handling.
pub struct DiscordAdapter {
    orchestrator: Arc<InviteOrchestrator>,
    guilds: Arc<GuildStore>,
    sessions: Arc<AuthSessions>,
    oauth: Arc<OAuthClient>,
    rest: Arc<DiscordRestClient>,
}

impl DiscordAdapter {
    pub fn new(
        orchestrator: Arc<InviteOrchestrator>,
        guilds: Arc<GuildStore>,
        sessions: Arc<AuthSessions>,
        oauth: Arc<OAuthClient>,
        rest: Arc<DiscordRestClient>,
    ) -> Self {
        Self {
            orchestrator,
            guilds,
            sessions,
            oauth,
            rest,
        }
    }

    fn context(
        &self,
        guild_id: String,
        channel_id: String,
        author_id: String,
        member_roles: Vec<String>,
        mention_roles: Vec<String>,
    ) -> DiscordContext {
        DiscordContext {
            guild_id,
            channel_id,
            author_id,
            member_roles,
            mention_roles,
            rest: self.rest.clone(),
        }
    }

    /// Mutating commands require the admin flag or the guild's edit role.
    async fn require_editor(&self, ctx: &DiscordContext) -> Result<()> {
        let edit_role = self.guilds.edit_role(&ctx.guild_id).await?;
        if ctx.is_admin_or_has_role(edit_role.as_deref()).await {
            Ok(())
        } else {
            Err(UsherError::permission(
                "you don't have the permission to manage invites for this server.",
            ))
        }
    }

    async fn cmd_link(&self, ctx: Arc<DiscordContext>, args: Vec<String>) -> Result<()> {
        self.require_editor(&ctx).await?;
        let (channel, rest) = split_channel_arg(&args)?;
        let request = parse_link_args(rest)?;
        let link = self.orchestrator.link(&ctx.guild_id, &channel, request).await?;
        ctx.reply(&format!(
            "invites for the channel {channel} are now enabled over {}.",
            link.options.mode.describe()
        ))
        .await;
        Ok(())
    }

    async fn cmd_update(&self, ctx: Arc<DiscordContext>, args: Vec<String>) -> Result<()> {
        self.require_editor(&ctx).await?;
        let (channel, rest) = split_channel_arg(&args)?;
        let patch = parse_update_args(rest)?;
        self.orchestrator.update(&ctx.guild_id, &channel, patch).await?;
        ctx.reply(&format!("updated invite options for the channel {channel}."))
            .await;
        Ok(())
    }

    async fn cmd_unlink(&self, ctx: Arc<DiscordContext>, args: Vec<String>) -> Result<()> {
        self.require_editor(&ctx).await?;
        let (channel, _) = split_channel_arg(&args)?;
        let report = self.orchestrator.unlink(Some(&ctx.guild_id), &channel).await?;
        if report.cleanup_failures.is_empty() {
            ctx.reply(&format!("invites are off now for the channel {channel}."))
                .await;
        } else {
            ctx.reply(&format!(
                "invites are off now for the channel {channel}, but {}.",
                report.cleanup_failures.join(" and ")
            ))
            .await;
        }
        Ok(())
    }

    async fn cmd_list(&self, ctx: Arc<DiscordContext>, _args: Vec<String>) -> Result<()> {
        self.require_editor(&ctx).await?;
        let mut channels = self.orchestrator.list(&ctx.guild_id).await?;
        if channels.is_empty() {
            ctx.reply("no channels found for this server.").await;
            return Ok(());
        }
        channels.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        let listing: Vec<String> = channels
            .iter()
            .map(|channel| format!("- {channel}"))
            .collect();
        ctx.reply(&format!(
            "found the following channels for this server:\n{}",
            listing.join("\n")
        ))
        .await;
        Ok(())
    }

    async fn cmd_info(&self, ctx: Arc<DiscordContext>, args: Vec<String>) -> Result<()> {
        self.require_editor(&ctx).await?;
        let (channel, _) = split_channel_arg(&args)?;
        let link = self.orchestrator.link_info(&ctx.guild_id, &channel).await?;
        ctx.reply(&format!(
            "invites for the channel {channel} have {} usages, a valid time of {} mins and are available over {}.",
            link.options.usage_limit,
            link.options.validity_secs / 60,
            link.options.mode.describe()
        ))
        .await;
        Ok(())
    }

    async fn cmd_set_role(&self, ctx: Arc<DiscordContext>, _args: Vec<String>) -> Result<()> {
        // Deciding who may edit is reserved for admins; the edit role
        // itself must not grant this.
        if !ctx.is_admin().await {
            return Err(UsherError::permission(
                "you don't have the permission to set the role.",
            ));
        }
        match ctx.mention_roles.as_slice() {
            [] => Err(UsherError::validation("no role mentioned.")),
            [role_id] => {
                self.guilds.set_edit_role(&ctx.guild_id, role_id).await?;
                ctx.reply(&format!("set the allowed role to <@&{role_id}>."))
                    .await;
                Ok(())
            }
            _ => Err(UsherError::validation(
                "too many roles mentioned. Only mention one role.",
            )),
        }
    }

    async fn cmd_authorize(&self, ctx: Arc<DiscordContext>, args: Vec<String>) -> Result<()> {
        self.require_editor(&ctx).await?;
        let (channel, _) = split_channel_arg(&args)?;
        let state = self.sessions.begin(&channel, &ctx.guild_id).await?;
        let url = self.oauth.authorize_url(&state);
        let dm = format!(
            "please authorize me for {channel} so I can manage channel point redemptions: {url}"
        );
        if let Err(err) = self.rest.send_direct_message(&ctx.author_id, &dm).await {
            // Without the DM the link never reaches the operator; free the
            // channel for another attempt instead of blocking it for the
            // session lifetime.
            self.sessions.abort(&state).await?;
            return Err(UsherError::upstream(format!("authorization DM failed: {err}")));
        }
        ctx.reply("I have sent you a DM with the authorization link.")
            .await;
        Ok(())
    }

    async fn cmd_help(&self, ctx: Arc<DiscordContext>, _args: Vec<String>) -> Result<()> {
        ctx.reply(
            "commands: link <channel> [-c] [-cp] [-u <usages>] [-t <minutes>], \
             update <channel> [usages] [minutes], unlink <channel>, list, \
             info <channel>, setRole @role, authorize <channel>, help",
        )
        .await;
        Ok(())
    }

    async fn handle_guild_create(&self, guild_id: &str) {
        if let Err(err) = self.guilds.ensure(guild_id).await {
            error!(guild = guild_id, error = %err, "Could not record new guild");
        }
    }

    /// Removal cascade: drop every link (with its teardown effects), then
    /// the guild record itself.
    async fn handle_guild_delete(&self, guild_id: &str) {
        info!(guild = guild_id, "Removed from guild, cascading");
        if let Err(err) = self.orchestrator.guild_removed(guild_id).await {
            error!(guild = guild_id, error = %err, "Guild link cascade failed");
        }
        if let Err(err) = self.guilds.remove(guild_id).await {
            error!(guild = guild_id, error = %err, "Could not drop guild record");
        }
    }
}

type Handler =
    Box<dyn Fn(Arc<DiscordContext>, Vec<String>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

fn handler<F>(adapter: &Arc<DiscordAdapter>, method: F) -> Handler
where
    F: Fn(Arc<DiscordAdapter>, Arc<DiscordContext>, Vec<String>) -> BoxFuture<'static, Result<()>>
        + Send
        + Sync
        + 'static,
{
    let adapter = adapter.clone();
    Box::new(move |ctx, args| method(adapter.clone(), ctx, args))
}

/// Build the messaging-side router. Duplicate names abort startup.
pub fn build_router(
    adapter: &Arc<DiscordAdapter>,
    prefix: &str,
) -> std::result::Result<CommandRouter<DiscordContext>, DuplicateCommandError> {
    let mut router = CommandRouter::new(prefix);
    router.register("link", handler(adapter, |a, c, args| {
        Box::pin(async move { a.cmd_link(c, args).await })
    }))?;
    router.register("update", handler(adapter, |a, c, args| {
        Box::pin(async move { a.cmd_update(c, args).await })
    }))?;
    router.register("unlink", handler(adapter, |a, c, args| {
        Box::pin(async move { a.cmd_unlink(c, args).await })
    }))?;
    router.register("list", handler(adapter, |a, c, args| {
        Box::pin(async move { a.cmd_list(c, args).await })
    }))?;
    router.register("info", handler(adapter, |a, c, args| {
        Box::pin(async move { a.cmd_info(c, args).await })
    }))?;
    router.register("setRole", handler(adapter, |a, c, args| {
        Box::pin(async move { a.cmd_set_role(c, args).await })
    }))?;
    router.register("authorize", handler(adapter, |a, c, args| {
        Box::pin(async move { a.cmd_authorize(c, args).await })
    }))?;
    router.register("help", handler(adapter, |a, c, args| {
        Box::pin(async move { a.cmd_help(c, args).await })
    }))?;
    Ok(router)
}

/// Consume gateway events: spawn a dispatch per message so slow handlers
/// never block the stream, and run the guild lifecycle inline.
pub fn spawn_event_loop(
    adapter: Arc<DiscordAdapter>,
    router: Arc<CommandRouter<DiscordContext>>,
    mut events: mpsc::Receiver<GatewayEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                GatewayEvent::MessageCreate {
                    guild_id,
                    channel_id,
                    author_id,
                    author_is_bot,
                    content,
                    member_roles,
                    mention_roles,
                } => {
                    if author_is_bot {
                        continue;
                    }
                    let ctx = Arc::new(adapter.context(
                        guild_id,
                        channel_id,
                        author_id,
                        member_roles,
                        mention_roles,
                    ));
                    let router = router.clone();
                    tokio::spawn(async move {
                        router.dispatch(&content, ctx).await;
                    });
                }
                GatewayEvent::GuildCreate { guild_id } => {
                    adapter.handle_guild_create(&guild_id).await;
                }
                GatewayEvent::GuildDelete { guild_id } => {
                    adapter.handle_guild_delete(&guild_id).await;
                }
            }
        }
    })
}

/// First argument is always the channel; reject its absence early.
fn split_channel_arg(args: &[String]) -> Result<(ChannelName, &[String])> {
    let (first, rest) = args
        .split_first()
        .ok_or_else(|| UsherError::validation("no channel provided."))?;
    let channel = ChannelName::new(first);
    if channel.is_empty() {
        return Err(UsherError::validation("no channel provided."));
    }
    Ok((channel, rest))
}

fn has_flag(args: &[String], short: &str, long: &str) -> bool {
    args.iter().any(|arg| arg == short || arg == long)
}

fn flag_value(args: &[String], short: &str, long: &str, what: &str) -> Result<Option<u64>> {
    let index = match args.iter().position(|arg| arg == short || arg == long) {
        Some(index) => index,
        None => return Ok(None),
    };
    let value = args
        .get(index + 1)
        .ok_or_else(|| UsherError::validation(format!("{what} needs a value.")))?;
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|_| UsherError::validation(format!("{what} must be a number.")))
}

fn parse_link_args(args: &[String]) -> Result<LinkRequest> {
    Ok(LinkRequest {
        chat: has_flag(args, "-c", "--chat"),
        channel_points: has_flag(args, "-cp", "--channelpoints"),
        usage_limit: flag_value(args, "-u", "--usages", "usages")?.map(|value| value as u32),
        validity_secs: flag_value(args, "-t", "--time", "time")?.map(|minutes| minutes * 60),
    })
}

/// `update <channel> [usages] [ageMinutes]` — trailing positions may be
/// omitted and then stay unchanged.
fn parse_update_args(args: &[String]) -> Result<LinkPatch> {
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
    let patch = LinkPatch {
        usage_limit,
        validity_secs,
    };
    if patch.is_empty() {
        return Err(UsherError::validation(
            "provide the usages and/or the time to update.",
        ));
    }
    Ok(patch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::http_client::mock::MockHttpClient;
    use crate::adapters::http_client::HttpClient;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn link_args_parse_flags_and_values() {
        let request =
            parse_link_args(&strings(&["-c", "-cp", "-u", "5", "--time", "30"])).unwrap();
        assert!(request.chat);
        assert!(request.channel_points);
        assert_eq!(request.usage_limit, Some(5));
        assert_eq!(request.validity_secs, Some(30 * 60));
    }

    #[test]
    fn link_args_leave_omitted_values_unset() {
        let request = parse_link_args(&strings(&["-c"])).unwrap();
        assert!(request.chat);
        assert!(!request.channel_points);
        assert_eq!(request.usage_limit, None);
        assert_eq!(request.validity_secs, None);
    }

    #[test]
    fn flag_without_value_is_a_validation_error() {
        let err = parse_link_args(&strings(&["-c", "-u"])).unwrap_err();
        assert!(matches!(err, UsherError::Validation(_)));
        let err = parse_link_args(&strings(&["-c", "-u", "lots"])).unwrap_err();
        assert!(matches!(err, UsherError::Validation(_)));
    }

    #[test]
    fn update_args_allow_partial_positions() {
        let patch = parse_update_args(&strings(&["5"])).unwrap();
        assert_eq!(patch.usage_limit, Some(5));
        assert_eq!(patch.validity_secs, None);

        let patch = parse_update_args(&strings(&["5", "30"])).unwrap();
        assert_eq!(patch.validity_secs, Some(1800));

        assert!(parse_update_args(&[]).is_err());
    }

    #[test]
    fn channel_argument_is_normalized() {
        let args = strings(&["#MixedCase", "-c"]);
        let (channel, rest) = split_channel_arg(&args).unwrap();
        assert_eq!(channel, ChannelName::new("mixedcase"));
        assert_eq!(rest.len(), 1);

        assert!(split_channel_arg(&strings(&["#"])).is_err());
        assert!(split_channel_arg(&[]).is_err());
    }

    #[tokio::test]
    async fn edit_role_short_circuits_before_any_lookup() {
        let http = Arc::new(MockHttpClient::new());
        let rest = Arc::new(DiscordRestClient::new(
            http.clone() as Arc<dyn HttpClient>,
            "token",
        ));
        let ctx = DiscordContext {
            guild_id: "g1".into(),
            channel_id: "c1".into(),
            author_id: "u1".into(),
            member_roles: vec!["r-edit".into()],
            mention_roles: vec![],
            rest,
        };
        // No scripted responses: a REST call would fail the test.
        assert!(ctx.is_admin_or_has_role(Some("r-edit")).await);
        assert!(http.requests().is_empty());
    }

    #[tokio::test]
    async fn guild_owner_counts_as_admin() {
        let http = Arc::new(MockHttpClient::new());
        http.push_response(200, r#"{"owner_id":"u1","system_channel_id":null}"#);
        let rest = Arc::new(
            DiscordRestClient::new(http.clone() as Arc<dyn HttpClient>, "token")
                .with_base_url("http://discord.test"),
        );
        let ctx = DiscordContext {
            guild_id: "g1".into(),
            channel_id: "c1".into(),
            author_id: "u1".into(),
            member_roles: vec![],
            mention_roles: vec![],
            rest,
        };
        assert!(ctx.is_admin().await);
    }

    #[tokio::test]
    async fn admin_comes_from_role_permission_bits() {
        let http = Arc::new(MockHttpClient::new());
        http.push_response(200, r#"{"owner_id":"someone-else","system_channel_id":null}"#);
        http.push_response(
            200,
            r#"[{"id":"r-admin","name":"Admins","permissions":"8"},
                {"id":"r-plain","name":"Members","permissions":"1024"}]"#,
        );
        let rest = Arc::new(
            DiscordRestClient::new(http.clone() as Arc<dyn HttpClient>, "token")
                .with_base_url("http://discord.test"),
        );
        let ctx = DiscordContext {
            guild_id: "g1".into(),
            channel_id: "c1".into(),
            author_id: "u1".into(),
            member_roles: vec!["r-admin".into()],
            mention_roles: vec![],
            rest,
        };
        assert!(ctx.is_admin().await);
    }
}
