use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Database, StoreError};

/// Per-guild bot state: which role (besides administrators) may manage
/// links.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuildRecord {
    /// Role id allowed to run mutating commands. `None` means admins only.
    pub edit_role: Option<String>,
}

/// Collection of [`GuildRecord`] rows, keyed by guild id.
pub struct GuildStore {
    db: Arc<Database>,
}

impl GuildStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Make sure a record exists for the guild. Called when the bot is
    /// added to a guild; a no-op when one is already there.
    pub async fn ensure(&self, guild_id: &str) -> Result<(), StoreError> {
        let guild_id = guild_id.to_string();
        self.db
            .mutate(|c| {
                c.guilds.entry(guild_id).or_default();
                Ok(())
            })
            .await
    }

    pub async fn remove(&self, guild_id: &str) -> Result<bool, StoreError> {
        let guild_id = guild_id.to_string();
        self.db
            .mutate(|c| Ok(c.guilds.remove(&guild_id).is_some()))
            .await
    }

    pub async fn edit_role(&self, guild_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .db
            .read(|c| c.guilds.get(guild_id).and_then(|g| g.edit_role.clone()))
            .await)
    }

    pub async fn set_edit_role(&self, guild_id: &str, role_id: &str) -> Result<(), StoreError> {
        let guild_id = guild_id.to_string();
        let role_id = role_id.to_string();
        self.db
            .mutate(|c| {
                c.guilds.entry(guild_id).or_default().edit_role = Some(role_id);
                Ok(())
            })
            .await
    }
}
