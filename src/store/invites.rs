use std::sync::Arc;

use super::{Database, StoreError};
use crate::channel::ChannelName;

/// Tracks the most recently issued invite code per channel so it can be
/// revoked later. One row per channel, replaced on every issuance.
pub struct InviteRecordStore {
    db: Arc<Database>,
}

impl InviteRecordStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn set_last(&self, channel: &ChannelName, code: &str) -> Result<(), StoreError> {
        let key = channel.as_str().to_string();
        let code = code.to_string();
        self.db
            .mutate(|c| {
                c.last_invites.insert(key.clone(), code);
                Ok(())
            })
            .await
    }

    pub async fn last(&self, channel: &ChannelName) -> Result<Option<String>, StoreError> {
        Ok(self
            .db
            .read(|c| c.last_invites.get(channel.as_str()).cloned())
            .await)
    }

    pub async fn remove(&self, channel: &ChannelName) -> Result<bool, StoreError> {
        let key = channel.as_str().to_string();
        self.db
            .mutate(|c| Ok(c.last_invites.remove(&key).is_some()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn last_invite_is_replaced_on_reissue() {
        let store = InviteRecordStore::new(Database::in_memory());
        let channel = ChannelName::new("#demo");

        store.set_last(&channel, "abc123").await.unwrap();
        store.set_last(&channel, "def456").await.unwrap();

        assert_eq!(store.last(&channel).await.unwrap().as_deref(), Some("def456"));
        assert!(store.remove(&channel).await.unwrap());
        assert_eq!(store.last(&channel).await.unwrap(), None);
        assert!(!store.remove(&channel).await.unwrap());
    }
}
