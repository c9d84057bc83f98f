use thiserror::Error;

/// Fatal conditions detected while constructing a [`crate::SessionManager`].
///
/// Construction itself never fails: the error is captured and reported from
/// the first attempt to actually use the session, so a service can come up
/// far enough to log what is wrong with its deployment.
#[derive(Debug, Clone, Error)]
pub enum BootError {
    #[error("missing configuration item: {0}")]
    MissingConfiguration(&'static str),
    #[error("security context initialisation failed: {0}")]
    Security(String),
    #[error("persist durations could not be loaded: {0}")]
    PersistDurations(String),
}
