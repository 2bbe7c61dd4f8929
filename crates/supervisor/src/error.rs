use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("a supervisor named {name} is already running")]
    AlreadyRunning { name: String },

    #[error(transparent)]
    Config(#[from] warden_config::Error),

    #[error(transparent)]
    Extension(#[from] warden_extensions::Error),

    #[error(transparent)]
    Protocol(#[from] warden_protocol::Error),

    #[error(transparent)]
    Store(#[from] warden_store::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{operation} is not supported on this platform")]
    Unsupported { operation: &'static str },

    /// Replacing the process image failed after descriptors were closed.
    #[error("exec failed: {message}")]
    Exec { message: String },

    #[error("{message}")]
    Message { message: String },

    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
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
    pub fn already_running(name: impl Into<String>) -> Self {
        Self::AlreadyRunning { name: name.into() }
    }

    #[must_use]
    pub fn exec(message: impl std::fmt::Display) -> Self {
        Self::Exec {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
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

pub type Result<T> = std::result::Result<T, Error>;

warden_common::impl_context!();
