use crate::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{0} is not connected")]
    NotReady(String),
    #[error("no slot with role {0}")]
    UnknownRole(String),
    #[error("role {0} configured twice")]
    DuplicateRole(String),
    #[error("session has shut down")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to access config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config file: {0}")]
    Malformed(String),
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no password has been set")]
    NotConfigured,
    #[error("password not recognized")]
    Mismatch,
}
