//! Usher bridges streaming-chat channels to messaging guilds: operators
//! link a channel to their guild, and viewers redeem single-use guild
//! invites by chat command or paid channel-point redemption.

pub mod adapters;
pub mod auth;
pub mod callback;
pub mod channel;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod presence;
pub mod router;
pub mod store;

pub use channel::ChannelName;
pub use config::AppConfig;
pub use error::UsherError;
pub use orchestrator::InviteOrchestrator;
