//! JSON document store backing every durable collection.
//!
//! One file holds all collections; it is loaded once at startup and
//! atomically rewritten (temp file + rename) after every mutation. Tests
//! run against an in-memory instance with identical semantics.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub mod credentials;
pub mod guilds;
pub mod invites;
pub mod links;
pub mod sessions;

pub use credentials::{Credential, CredentialStore, TokenData};
pub use guilds::GuildStore;
pub use invites::InviteRecordStore;
pub use links::{Link, LinkOptions, LinkPatch, LinkStore, RedemptionMode};
pub use sessions::{AuthorizationSession, SessionStore};

/// Store failures. `AlreadyExists` is the duplicate-key condition callers
/// match on; everything else is a transport problem.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("store io failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization failure: {0}")]
    Serde(#[from] serde_json::Error),
}

/// All persisted collections, keyed as the data model specifies.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Collections {
    #[serde(default)]
    pub links: HashMap<String, Link>,
    #[serde(default)]
    pub guilds: HashMap<String, guilds::GuildRecord>,
    #[serde(default)]
    pub credentials: HashMap<String, Credential>,
    #[serde(default)]
    pub last_invites: HashMap<String, String>,
    #[serde(default)]
    pub sessions: HashMap<String, AuthorizationSession>,
}

enum Backing {
    File(PathBuf),
    Memory,
}

/// Handle to the document store. Collection stores share one `Database`
/// through an `Arc`.
pub struct Database {
    backing: Backing,
    collections: RwLock<Collections>,
}

impl Database {
    /// Open (or initialize) the store file at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Arc<Self>, StoreError> {
        let path = path.into();
        let collections = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let collections: Collections = serde_json::from_slice(&bytes)?;
                info!(
                    path = %path.display(),
                    links = collections.links.len(),
                    "Store loaded"
                );
                collections
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No store file found, starting empty");
                Collections::default()
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Arc::new(Self {
            backing: Backing::File(path),
            collections: RwLock::new(collections),
        }))
    }

    /// In-memory store with identical semantics, for tests.
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            backing: Backing::Memory,
            collections: RwLock::new(Collections::default()),
        })
    }

    /// Read access to the collections.
    pub(crate) async fn read<R>(&self, f: impl FnOnce(&Collections) -> R) -> R {
        let guard = self.collections.read().await;
        f(&guard)
    }

    /// Apply a mutation and persist the result. The closure's error short
    /// circuits without touching the file; a persistence failure after a
    /// successful mutation is returned as `Io`.
    pub(crate) async fn mutate<R>(
        &self,
        f: impl FnOnce(&mut Collections) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut guard = self.collections.write().await;
        let result = f(&mut guard)?;
        self.persist(&guard).await?;
        Ok(result)
    }

    async fn persist(&self, collections: &Collections) -> Result<(), StoreError> {
        let path = match &self.backing {
            Backing::File(path) => path,
            Backing::Memory => return Ok(()),
        };
        let bytes = serde_json::to_vec_pretty(collections)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), "Store saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelName;

    #[tokio::test]
    async fn reload_roundtrips_collections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let db = Database::open(&path).await.unwrap();
        let links = LinkStore::new(db.clone());
        links
            .create(Link {
                channel: ChannelName::new("#demo"),
                guild_id: "g1".into(),
                options: LinkOptions {
                    usage_limit: 1,
                    validity_secs: 900,
                    mode: RedemptionMode::Chat,
                },
                reward_id: None,
            })
            .await
            .unwrap();
        drop(links);
        drop(db);

        let db = Database::open(&path).await.unwrap();
        let links = LinkStore::new(db);
        let link = links.get(&ChannelName::new("demo")).await.unwrap().unwrap();
        assert_eq!(link.guild_id, "g1");
    }

    #[tokio::test]
    async fn failed_mutation_leaves_state_untouched() {
        let db = Database::in_memory();
        let links = LinkStore::new(db.clone());
        let link = Link {
            channel: ChannelName::new("#demo"),
            guild_id: "g1".into(),
            options: LinkOptions {
                usage_limit: 1,
                validity_secs: 900,
                mode: RedemptionMode::Chat,
            },
            reward_id: None,
        };
        links.create(link.clone()).await.unwrap();
        let err = links.create(link).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert_eq!(
            db.read(|c| c.links.len()).await,
            1,
            "duplicate create must not clobber the existing row"
        );
    }
}
