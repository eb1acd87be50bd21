use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, error, info};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use usher::adapters::discord::{self, DiscordAdapter};
use usher::adapters::discord_gateway;
use usher::adapters::discord_rest::DiscordRestClient;
use usher::adapters::helix::HelixRewards;
use usher::adapters::http_client::{HttpClient, ReqwestHttpClient};
use usher::adapters::twitch::{self, TwitchAdapter};
use usher::adapters::twitch_chat;
use usher::adapters::{ChatHandle, GuildHandle, RewardHandle};
use usher::auth::{AuthSessions, OAuthClient, TokenVault};
use usher::callback::{self, CallbackState};
use usher::config::AppConfig;
use usher::orchestrator::InviteOrchestrator;
use usher::presence;
use usher::store::{CredentialStore, Database, GuildStore, InviteRecordStore, LinkStore};

const DEFAULT_CONFIG_PATH: &str = "usher.config.json";
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if it exists.
    let env_file_path = dotenvy::dotenv().ok();

    // Initialize the tracing subscriber for structured logging.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if cfg!(debug_assertions) {
                "usher=debug,warn".into()
            } else {
                "usher=info,warn".into()
            }
        }))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    info!("Usher starting");
    match env_file_path {
        Some(path) => info!("Loaded environment variables from {}", path.display()),
        None => debug!("No .env file found. Using existing environment variables."),
    }

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = AppConfig::load(&config_path)?;

    // Document store and its collections.
    let db = Database::open(&config.store_path).await?;
    let links = Arc::new(LinkStore::new(db.clone()));
    let guilds = Arc::new(GuildStore::new(db.clone()));
    let credentials = Arc::new(CredentialStore::new(db.clone()));
    let invites = Arc::new(InviteRecordStore::new(db.clone()));
    let sessions = Arc::new(AuthSessions::new(db));

    // Outbound platform surfaces, all sharing one HTTP client.
    let http: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new());
    let oauth = Arc::new(OAuthClient::new(
        http.clone(),
        config.twitch.client_id.clone(),
        config.twitch.client_secret.clone(),
        config.redirect_uri(),
    ));
    let vault = Arc::new(TokenVault::new(credentials, oauth.clone()));
    let rest = Arc::new(DiscordRestClient::new(
        http.clone(),
        config.discord.token.clone(),
    ));
    let rewards: Arc<dyn RewardHandle> = Arc::new(HelixRewards::new(
        http,
        vault.clone(),
        config.twitch.client_id.clone(),
    ));

    let (chat_client, chat_messages) =
        twitch_chat::connect(&config.twitch.username, &config.twitch.chat_token).await?;
    let chat: Arc<dyn ChatHandle> = Arc::new(chat_client);

    let orchestrator = Arc::new(InviteOrchestrator::new(
        links.clone(),
        invites,
        chat.clone(),
        rest.clone() as Arc<dyn GuildHandle>,
        rewards,
    ));

    // Join every linked chat channel before any command is dispatched, so
    // viewer commands during startup are not missed.
    presence::synchronize(&links, chat.as_ref()).await?;

    let twitch_adapter = Arc::new(TwitchAdapter::new(orchestrator.clone(), chat.clone()));
    let twitch_router = Arc::new(twitch::build_router(&twitch_adapter, &config.command_prefix)?);
    twitch::spawn_message_loop(twitch_adapter, twitch_router, chat_messages);

    let discord_adapter = Arc::new(DiscordAdapter::new(
        orchestrator,
        guilds,
        sessions.clone(),
        oauth,
        rest,
    ));
    let discord_router = Arc::new(discord::build_router(
        &discord_adapter,
        &config.command_prefix,
    )?);
    let gateway_events = discord_gateway::spawn(config.discord.token.clone());
    discord::spawn_event_loop(discord_adapter, discord_router, gateway_events);

    // Reap expired authorization sessions in the background.
    {
        let sessions = sessions.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SESSION_SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                if let Err(err) = sessions.sweep().await {
                    error!(error = %err, "Session sweep failed");
                }
            }
        });
    }

    let callback_state = Arc::new(CallbackState { sessions, vault });
    let port = config.callback.port;
    tokio::select! {
        result = callback::serve(callback_state, port) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
