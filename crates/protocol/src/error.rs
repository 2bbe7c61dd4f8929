use std::error::Error as StdError;

/// Crate-wide result type for connection operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed connection errors shared by every network implementation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The network refused an identity because someone else holds it.
    #[error("identity {identity:?} is already in use")]
    IdentityTaken { identity: String },

    /// The connection has ended or was handed off.
    #[error("not connected")]
    NotConnected,

    /// Registration with the server failed.
    #[error("handshake failed: {message}")]
    Handshake { message: String },

    #[error("timed out waiting for {operation}")]
    Timeout { operation: &'static str },

    #[error("{operation} is not supported on this platform")]
    Unsupported { operation: &'static str },

    #[error("{message}")]
    Message { message: String },

    /// Wrapped source error from an external dependency.
    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn identity_taken(identity: impl Into<String>) -> Self {
        Self::IdentityTaken {
            identity: identity.into(),
        }
    }

    #[must_use]
    pub fn handshake(message: impl std::fmt::Display) -> Self {
        Self::Handshake {
            message: message.to_string(),
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

impl warden_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

warden_common::impl_context!();
