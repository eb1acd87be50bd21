use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Database, StoreError};
use crate::channel::ChannelName;

/// The token pair a credential currently holds. Refreshed in place as the
/// access token ages out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: String,
    /// When the access token expires. `None` means the platform did not
    /// say; the token is then assumed valid until a call fails.
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenData {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires) if expires <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Durable OAuth grant for one channel's owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub channel: ChannelName,
    /// The authorization code the grant was exchanged from. Kept for
    /// support triage; never re-exchanged.
    pub authorization_code: String,
    pub scopes: Vec<String>,
    pub token: TokenData,
}

/// Collection of [`Credential`] rows, keyed by canonical channel name.
pub struct CredentialStore {
    db: Arc<Database>,
}

impl CredentialStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or replace the credential for a channel. Authorization
    /// completion always overwrites whatever grant was there before.
    pub async fn upsert(&self, credential: Credential) -> Result<(), StoreError> {
        let key = credential.channel.as_str().to_string();
        self.db
            .mutate(|c| {
                c.credentials.insert(key.clone(), credential);
                Ok(())
            })
            .await
    }

    pub async fn get(&self, channel: &ChannelName) -> Result<Option<Credential>, StoreError> {
        Ok(self
            .db
            .read(|c| c.credentials.get(channel.as_str()).cloned())
            .await)
    }

    /// Replace the token data on an existing credential, as the refresh
    /// callback does. Returns whether a credential was there to update.
    pub async fn update_token(
        &self,
        channel: &ChannelName,
        token: TokenData,
    ) -> Result<bool, StoreError> {
        let key = channel.as_str().to_string();
        self.db
            .mutate(|c| match c.credentials.get_mut(&key) {
                Some(credential) => {
                    credential.token = token;
                    Ok(true)
                }
                None => Ok(false),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn credential(channel: &str) -> Credential {
        Credential {
            channel: ChannelName::new(channel),
            authorization_code: "code".into(),
            scopes: vec!["channel:manage:redemptions".into()],
            token: TokenData {
                access_token: "access-1".into(),
                refresh_token: "refresh-1".into(),
                expires_at: None,
            },
        }
    }

    #[tokio::test]
    async fn upsert_overwrites_previous_grant() {
        let store = CredentialStore::new(Database::in_memory());
        store.upsert(credential("#demo")).await.unwrap();

        let mut replacement = credential("#demo");
        replacement.token.access_token = "access-2".into();
        store.upsert(replacement).await.unwrap();

        let row = store.get(&ChannelName::new("demo")).await.unwrap().unwrap();
        assert_eq!(row.token.access_token, "access-2");
    }

    #[tokio::test]
    async fn update_token_requires_existing_credential() {
        let store = CredentialStore::new(Database::in_memory());
        let token = TokenData {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: None,
        };
        assert!(!store
            .update_token(&ChannelName::new("#demo"), token.clone())
            .await
            .unwrap());

        store.upsert(credential("#demo")).await.unwrap();
        assert!(store
            .update_token(&ChannelName::new("#demo"), token)
            .await
            .unwrap());
    }

    #[test]
    fn expiry_checks_use_the_given_instant() {
        let now = Utc::now();
        let token = TokenData {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: Some(now + Duration::seconds(60)),
        };
        assert!(!token.is_expired_at(now));
        assert!(token.is_expired_at(now + Duration::seconds(61)));

        let unknown = TokenData {
            expires_at: None,
            ..token
        };
        assert!(!unknown.is_expired_at(now));
    }
}
