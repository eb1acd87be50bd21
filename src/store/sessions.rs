use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Database, StoreError};
use crate::channel::ChannelName;

/// One in-flight OAuth authorization, correlating the callback's `state`
/// parameter back to the (channel, guild) pair that requested it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationSession {
    pub state_token: String,
    pub channel: ChannelName,
    pub guild_id: String,
    /// Hard expiry; rows past this instant are treated as absent by every
    /// accessor and reaped by the periodic sweep.
    pub expires_at: DateTime<Utc>,
}

impl AuthorizationSession {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Raw CRUD for [`AuthorizationSession`] rows, keyed by state token. The
/// TTL and conflict semantics live in [`crate::auth::AuthSessions`].
pub struct SessionStore {
    db: Arc<Database>,
}

impl SessionStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a session unless a live one already exists for its channel.
    /// Expired leftovers for the same channel are replaced, not counted as
    /// conflicts.
    pub async fn insert_if_channel_free(
        &self,
        session: AuthorizationSession,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.db
            .mutate(|c| {
                let stale: Vec<String> = c
                    .sessions
                    .values()
                    .filter(|s| s.channel == session.channel)
                    .map(|s| {
                        if s.is_expired_at(now) {
                            Ok(s.state_token.clone())
                        } else {
                            Err(StoreError::AlreadyExists(format!(
                                "authorization for {}",
                                session.channel
                            )))
                        }
                    })
                    .collect::<Result<_, _>>()?;
                for token in stale {
                    c.sessions.remove(&token);
                }
                c.sessions.insert(session.state_token.clone(), session);
                Ok(())
            })
            .await
    }

    /// Remove and return the session for a state token, if it is still
    /// live. Expired or unknown tokens both come back as `None`.
    pub async fn take(
        &self,
        state_token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AuthorizationSession>, StoreError> {
        let state_token = state_token.to_string();
        self.db
            .mutate(|c| {
                match c.sessions.remove(&state_token) {
                    Some(session) if !session.is_expired_at(now) => Ok(Some(session)),
                    // An expired row is gone either way; dropping it here
                    // and reporting "none" keeps the timeout/callback race
                    // silent on both sides.
                    _ => Ok(None),
                }
            })
            .await
    }

    pub async fn channel_has_live(
        &self,
        channel: &ChannelName,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self
            .db
            .read(|c| {
                c.sessions
                    .values()
                    .any(|s| s.channel == *channel && !s.is_expired_at(now))
            })
            .await)
    }

    /// Drop every expired row. Returns how many were reaped.
    pub async fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.db
            .mutate(|c| {
                let before = c.sessions.len();
                c.sessions.retain(|_, s| !s.is_expired_at(now));
                Ok(before - c.sessions.len())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(token: &str, channel: &str, expires_at: DateTime<Utc>) -> AuthorizationSession {
        AuthorizationSession {
            state_token: token.to_string(),
            channel: ChannelName::new(channel),
            guild_id: "g1".to_string(),
            expires_at,
        }
    }

    #[tokio::test]
    async fn live_session_blocks_second_insert_for_channel() {
        let store = SessionStore::new(Database::in_memory());
        let now = Utc::now();
        store
            .insert_if_channel_free(session("s1", "#demo", now + Duration::minutes(10)), now)
            .await
            .unwrap();
        let err = store
            .insert_if_channel_free(session("s2", "#demo", now + Duration::minutes(10)), now)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn expired_leftover_is_replaced_not_conflicting() {
        let store = SessionStore::new(Database::in_memory());
        let now = Utc::now();
        store
            .insert_if_channel_free(session("s1", "#demo", now - Duration::seconds(1)), now)
            .await
            .unwrap();
        store
            .insert_if_channel_free(session("s2", "#demo", now + Duration::minutes(10)), now)
            .await
            .unwrap();
        assert!(store.take("s1", now).await.unwrap().is_none());
        assert!(store.take("s2", now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn take_treats_expired_as_absent() {
        let store = SessionStore::new(Database::in_memory());
        let now = Utc::now();
        store
            .insert_if_channel_free(session("s1", "#demo", now + Duration::minutes(10)), now)
            .await
            .unwrap();
        assert!(store
            .take("s1", now + Duration::minutes(11))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn sweep_reaps_only_expired_rows() {
        let store = SessionStore::new(Database::in_memory());
        let now = Utc::now();
        store
            .insert_if_channel_free(session("s1", "#a", now + Duration::minutes(10)), now)
            .await
            .unwrap();
        store
            .insert_if_channel_free(session("s2", "#b", now + Duration::minutes(1)), now)
            .await
            .unwrap();

        let reaped = store
            .remove_expired(now + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(reaped, 1);
        assert!(store
            .channel_has_live(&ChannelName::new("#a"), now + Duration::minutes(5))
            .await
            .unwrap());
    }
}
