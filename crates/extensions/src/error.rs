use thiserror::Error;

use crate::context::{ContextKey, Scope};

#[derive(Debug, Error)]
pub enum Error {
    /// Not found on the search path, or the source failed to provide it.
    #[error("failed to load extension {name}: {reason}")]
    Load { name: String, reason: String },

    /// The extension still has live instances.
    #[error("extension {name} is still enabled in {count} context(s)")]
    Referenced { name: String, count: usize },

    #[error("extension {name} is not loaded")]
    NotLoaded { name: String },

    #[error("extension {name} is not enabled in {context}")]
    NotEnabled { name: String, context: ContextKey },

    #[error("extension {name} has {expected} scope and cannot be enabled in {got} context")]
    ScopeMismatch {
        name: String,
        expected: Scope,
        got: Scope,
    },

    #[error("extension {name} needs a client to be enabled in {context}")]
    MissingClient { name: String, context: ContextKey },

    #[error("failed to initialize extension {name}: {reason}")]
    Init { name: String, reason: String },

    #[error(transparent)]
    Store(#[from] warden_store::Error),

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
    pub fn load(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Load {
            name: name.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn not_loaded(name: impl Into<String>) -> Self {
        Self::NotLoaded { name: name.into() }
    }

    #[must_use]
    pub fn not_enabled(name: impl Into<String>, context: &ContextKey) -> Self {
        Self::NotEnabled {
            name: name.into(),
            context: context.clone(),
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
