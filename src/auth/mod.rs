pub mod oauth;
pub mod sessions;
pub mod vault;

pub use oauth::{OAuthClient, TokenResponse, SCOPES};
pub use sessions::{AuthSessions, Clock, SystemClock};
pub use vault::{ChannelClient, TokenVault};
