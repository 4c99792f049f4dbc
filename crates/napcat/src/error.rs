use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("WebSocket not connected")]
    NotConnected,

    #[error("client stopped")]
    Stopped,

    #[error("WebSocket reconnecting")]
    Reconnecting,

    #[error("API call {action} timed out")]
    Timeout { action: String },

    #[error("API returned status={status} retcode={retcode}")]
    Api { status: String, retcode: i64 },

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] napgate_config::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }
}

impl napgate_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

napgate_common::impl_context!();
