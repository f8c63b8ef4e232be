use thiserror::Error;

#[derive(Error, Debug)]
pub enum TftpError {
    /// Configuration is missing, unreadable, or fails validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// The listening socket could not be bound. Carries the operator-facing
    /// diagnostic that ServerState surfaces in its status text.
    #[error("service unavailable: {0}")]
    NoService(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TftpError>;
