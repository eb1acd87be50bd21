use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::{debug, info};

use crate::channel::ChannelName;
use crate::error::{Result, UsherError};
use crate::store::{AuthorizationSession, Database, SessionStore, StoreError};

/// How long an authorization may stay in flight before the state token
/// dies, regardless of outcome.
const SESSION_TTL_MINUTES: i64 = 10;

/// Injectable time source so the TTL is testable without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Tracker for in-flight OAuth authorizations.
///
/// Expiry is an explicit timestamp on each row, checked lazily by every
/// accessor and reaped by [`AuthSessions::sweep`]. The timeout racing an
/// inbound callback is therefore harmless: whichever side comes second
/// sees "no session" and treats it as a normal outcome.
pub struct AuthSessions {
    store: SessionStore,
    clock: Arc<dyn Clock>,
}

impl AuthSessions {
    pub fn new(db: Arc<Database>) -> Self {
        Self::with_clock(db, Arc::new(SystemClock))
    }

    pub fn with_clock(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: SessionStore::new(db),
            clock,
        }
    }

    /// Start an authorization for a channel, returning the state token to
    /// embed in the authorize URL. Fails with a conflict while another
    /// authorization for the same channel is still live.
    pub async fn begin(&self, channel: &ChannelName, guild_id: &str) -> Result<String> {
        let now = self.clock.now();
        let state_token = generate_state_token();
        let session = AuthorizationSession {
            state_token: state_token.clone(),
            channel: channel.clone(),
            guild_id: guild_id.to_string(),
            expires_at: now + Duration::minutes(SESSION_TTL_MINUTES),
        };
        match self.store.insert_if_channel_free(session, now).await {
            Ok(()) => {
                info!(channel = %channel, "Authorization session started");
                Ok(state_token)
            }
            Err(StoreError::AlreadyExists(_)) => Err(UsherError::conflict(format!(
                "an authorization for {channel} is already in progress"
            ))),
            Err(err) => Err(err.into()),
        }
    }

    /// Consume the session for a state token. Absent covers "already
    /// consumed", "expired", and "never existed" alike; the caller renders
    /// one generic "authorization not active" response for all three.
    pub async fn complete(&self, state_token: &str) -> Result<(ChannelName, String)> {
        let now = self.clock.now();
        match self.store.take(state_token, now).await? {
            Some(session) => {
                info!(channel = %session.channel, "Authorization session completed");
                Ok((session.channel, session.guild_id))
            }
            None => Err(UsherError::not_found("authorization not active")),
        }
    }

    pub async fn has(&self, channel: &ChannelName) -> Result<bool> {
        Ok(self.store.channel_has_live(channel, self.clock.now()).await?)
    }

    /// Drop the session for a state token. Removing an absent session is a
    /// no-op, so denial callbacks and the sweep can race freely.
    pub async fn abort(&self, state_token: &str) -> Result<()> {
        if self.store.take(state_token, self.clock.now()).await?.is_some() {
            debug!("Authorization session aborted");
        }
        Ok(())
    }

    /// Reap expired rows. `main` runs this on a periodic interval.
    pub async fn sweep(&self) -> Result<usize> {
        let reaped = self.store.remove_expired(self.clock.now()).await?;
        if reaped > 0 {
            debug!(reaped, "Expired authorization sessions reaped");
        }
        Ok(reaped)
    }
}

/// 256 bits from the thread-local CSPRNG, hex encoded. Predictable state
/// tokens would let an attacker complete someone else's authorization.
fn generate_state_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes[..]);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
