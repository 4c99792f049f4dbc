use std::error::Error as StdError;

/// Result of channel operations exposed to the host.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors a channel reports through its outbound and status surfaces.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad target, empty payload or similar caller mistake.
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// No live connection for the account.
    #[error("account {account_id} is not connected")]
    UnknownAccount { account_id: String },

    /// The platform rejected or could not complete the call.
    #[error("unavailable: {message}")]
    Unavailable { message: String },

    /// Wrapped source error from a collaborator (host, pairing store).
    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// JSON (de)serialization failed.
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

impl Error {
    #[must_use]
    pub fn invalid_input(message: impl std::fmt::Display) -> Self {
        Self::InvalidInput {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn unavailable(message: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn unknown_account(account_id: impl std::fmt::Display) -> Self {
        Self::UnknownAccount {
            account_id: account_id.to_string(),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }
}
