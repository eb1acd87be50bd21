use thiserror::Error;

use crate::store::StoreError;

/// Unified error type for everything that can go wrong while handling a
/// command or callback.
///
/// The first four variants carry text that is safe to show to the person
/// who triggered the operation. `Upstream` and `Persistence` carry internal
/// detail that belongs in the log; users only ever see a generic apology
/// for those (see [`UsherError::user_message`]).
#[derive(Error, Debug)]
pub enum UsherError {
    /// Bad or missing command arguments.
    #[error("validation: {0}")]
    Validation(String),

    /// Caller lacks the admin flag or the guild's edit role.
    #[error("permission: {0}")]
    Permission(String),

    /// The thing being created already exists or is already in progress.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Unknown channel, session, or record.
    #[error("not found: {0}")]
    NotFound(String),

    /// A platform API or token endpoint failed.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// The document store failed.
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl UsherError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn permission(msg: impl Into<String>) -> Self {
        Self::Permission(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    /// The reply text shown to the user who issued the command.
    ///
    /// Upstream and persistence detail never leaks here; it is logged at
    /// the dispatch boundary instead.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg)
            | Self::Permission(msg)
            | Self::Conflict(msg)
            | Self::NotFound(msg) => msg.clone(),
            Self::Upstream(_) | Self::Persistence(_) => {
                "something went wrong on my end, sorry! Please try again later.".to_string()
            }
        }
    }

    /// True for errors whose full detail belongs in the server log only.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Upstream(_) | Self::Persistence(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<StoreError> for UsherError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyExists(key) => Self::Conflict(format!("{key} already exists")),
            other => Self::Persistence(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, UsherError>;
