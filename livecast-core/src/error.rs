use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Storage provider could not initialize. Fatal at startup.
    #[error("Storage setup failed: {0}")]
    Setup(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Transcoder invocation failed to start. Fatal to the triggering transition.
    #[error("Transcoder error: {0}")]
    Transcoder(String),

    /// A staged file was not published. Contained inside the relay.
    #[error("Relay dropped {name}: {reason}")]
    RelayDrop { name: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Whether the error must abort startup instead of being logged and skipped.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::RelayDrop { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
