use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical streaming-chat channel name.
///
/// Every channel identifier entering the system goes through
/// [`ChannelName::new`] before it is used as a store key or sent to the
/// chat transport: lowercased, with exactly one leading `#`. Normalization
/// is idempotent, so `#Foo`, `foo` and `#foo` all compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
    pub fn new(raw: &str) -> Self {
        let bare = raw.trim().trim_start_matches('#').to_lowercase();
        Self(format!("#{bare}"))
    }

    /// The canonical form, with the leading `#`. Used as the store key and
    /// on the IRC wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The channel's login name, without the marker. This is what the
    /// platform REST API and broadcaster comparisons work with.
    pub fn login(&self) -> &str {
        &self.0[1..]
    }

    /// True when the canonical form holds no actual name.
    pub fn is_empty(&self) -> bool {
        self.0.len() <= 1
    }

    /// Whether `user` is the broadcaster of this channel.
    pub fn is_broadcaster(&self, username: &str) -> bool {
        self.login() == username.to_lowercase()
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
