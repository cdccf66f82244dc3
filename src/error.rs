use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("malformed frame: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("frame has no event name")]
    MissingEventName,
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("cache error: {0}")]
    Cache(#[from] rusqlite::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("event bus already connected once")]
    AlreadyConnected,
    #[error("event bus is not connected")]
    NotConnected,
    #[error("no active conversation")]
    NoActiveConversation,
    #[error("unknown conversation {0}")]
    UnknownConversation(String),
    #[error("could not resolve a recipient for the active conversation")]
    NoRecipient,
    #[error("message is empty")]
    EmptyMessage,
    #[error("history load for {0} was superseded by a newer selection")]
    Superseded(String),
    #[error("invalid session token: {0}")]
    InvalidToken(String),
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Self::Config(err.to_string())
    }
}
