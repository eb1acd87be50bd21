use std::env;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Environment variable names for secrets. Values present in the
/// environment override whatever the config file holds, so the file can be
/// committed without credentials in it.
const DISCORD_TOKEN_ENV: &str = "DISCORD_TOKEN";
const TWITCH_CHAT_TOKEN_ENV: &str = "TWITCH_CHAT_TOKEN";
const TWITCH_CLIENT_ID_ENV: &str = "TWITCH_CLIENT_ID";
const TWITCH_CLIENT_SECRET_ENV: &str = "TWITCH_CLIENT_SECRET";

/// Application configuration, deserialized from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// First token of every command message, on both platforms.
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    /// Path of the JSON document store.
    #[serde(default = "default_store_path")]
    pub store_path: String,
    pub discord: DiscordConfig,
    pub twitch: TwitchConfig,
    #[serde(default)]
    pub callback: CallbackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    /// Bot token for the messaging platform.
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwitchConfig {
    /// Login of the chat bot account.
    pub username: String,
    /// OAuth token the chat bot connects with (`oauth:` prefix optional).
    #[serde(default)]
    pub chat_token: String,
    /// Application client id for the authorization-code flow.
    #[serde(default)]
    pub client_id: String,
    /// Application client secret for the authorization-code flow.
    #[serde(default)]
    pub client_secret: String,
    /// Host the OAuth callback redirects to. `localhost` switches the
    /// redirect URI to plain http for development.
    pub redirect_host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackConfig {
    /// Port the callback HTTP server binds to.
    pub port: u16,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self { port: 8173 }
    }
}

fn default_command_prefix() -> String {
    "!ty".to_string()
}

fn default_store_path() -> String {
    "usher.store.json".to_string()
}

impl AppConfig {
    /// Load configuration from `path` and apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;
        info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(token) = env::var(DISCORD_TOKEN_ENV) {
            debug!("Using Discord token from environment");
            self.discord.token = token;
        }
        if let Ok(token) = env::var(TWITCH_CHAT_TOKEN_ENV) {
            debug!("Using Twitch chat token from environment");
            self.twitch.chat_token = token;
        }
        if let Ok(id) = env::var(TWITCH_CLIENT_ID_ENV) {
            self.twitch.client_id = id;
        }
        if let Ok(secret) = env::var(TWITCH_CLIENT_SECRET_ENV) {
            self.twitch.client_secret = secret;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.command_prefix.is_empty() {
            return Err(anyhow!("command_prefix must not be empty"));
        }
        if self.discord.token.is_empty() {
            return Err(anyhow!(
                "no Discord token configured (config file or {DISCORD_TOKEN_ENV})"
            ));
        }
        if self.twitch.client_id.is_empty() || self.twitch.client_secret.is_empty() {
            return Err(anyhow!(
                "no Twitch app credentials configured (config file or \
                 {TWITCH_CLIENT_ID_ENV}/{TWITCH_CLIENT_SECRET_ENV})"
            ));
        }
        Ok(())
    }

    /// Redirect URI registered with the platform for the OAuth callback.
    /// Plain http is only used for local development.
    pub fn redirect_uri(&self) -> String {
        let host = &self.twitch.redirect_host;
        let scheme = if host == "localhost" { "http" } else { "https" };
        if host == "localhost" {
            format!("{scheme}://{host}:{}/platform-callback", self.callback.port)
        } else {
            format!("{scheme}://{host}/platform-callback")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn load_fills_defaults() {
        let file = write_config(
            r#"{
                "discord": { "token": "bot-token" },
                "twitch": {
                    "username": "usherbot",
                    "chat_token": "oauth:abc",
                    "client_id": "id",
                    "client_secret": "secret",
                    "redirect_host": "invites.example.com"
                }
            }"#,
        );
        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.command_prefix, "!ty");
        assert_eq!(config.callback.port, 8173);
        assert_eq!(
            config.redirect_uri(),
            "https://invites.example.com/platform-callback"
        );
    }

    #[test]
    fn localhost_redirect_uses_http_and_port() {
        let file = write_config(
            r#"{
                "discord": { "token": "bot-token" },
                "twitch": {
                    "username": "usherbot",
                    "chat_token": "oauth:abc",
                    "client_id": "id",
                    "client_secret": "secret",
                    "redirect_host": "localhost"
                },
                "callback": { "port": 9000 }
            }"#,
        );
        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(
            config.redirect_uri(),
            "http://localhost:9000/platform-callback"
        );
    }

    #[test]
    fn missing_discord_token_is_rejected() {
        let file = write_config(
            r#"{
                "discord": { "token": "" },
                "twitch": {
                    "username": "usherbot",
                    "client_id": "id",
                    "client_secret": "secret",
                    "redirect_host": "localhost"
                }
            }"#,
        );
        // Only meaningful when the override variable is absent.
        if env::var(DISCORD_TOKEN_ENV).is_err() {
            assert!(AppConfig::load(file.path()).is_err());
        }
    }
}
