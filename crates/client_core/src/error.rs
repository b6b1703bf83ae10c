use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("identity conflict: {0}")]
    IdentityConflict(String),
    #[error("local cache write failed: {0}")]
    CacheWrite(String),
    #[error("server rejected request: {0}")]
    ServerRejection(String),
    #[error("no counterpart to start a chat with: {0}")]
    NoCounterpart(String),
    #[error("not logged in")]
    NotLoggedIn,
    #[error("invalid input: {0}")]
    Validation(String),
}

impl SyncError {
    /// Errors the UI is allowed to show; everything else degrades silently.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Self::NoCounterpart(_) | Self::NotLoggedIn | Self::Validation(_)
        )
    }
}
