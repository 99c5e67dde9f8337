use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Channel unbound: {0}")]
    Unbound(String),

    /// The peer answered with `isOk: false`; carries the peer's `result`.
    #[error("Remote call failed: {0}")]
    Remote(serde_json::Value),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Message text of a remote failure, when the peer sent one.
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            Error::Remote(value) => value.get("message").and_then(|v| v.as_str()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
