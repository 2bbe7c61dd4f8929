//! Activation contexts: where an extension instance lives.

use std::fmt;

use serde::{Deserialize, Serialize};

use warden_protocol::InboundMessage;

/// Kind of context an extension can be enabled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Global,
    Connection,
    Channel,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Connection => write!(f, "connection"),
            Self::Channel => write!(f, "channel"),
        }
    }
}

/// A concrete activation context. Channel names are stored lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContextKey {
    Global,
    Connection(String),
    Channel(String, String),
}

impl ContextKey {
    pub fn connection(client: impl Into<String>) -> Self {
        Self::Connection(client.into())
    }

    pub fn channel(client: impl Into<String>, channel: &str) -> Self {
        Self::Channel(client.into(), channel.to_lowercase())
    }

    /// The narrowest context a message is seen in.
    pub fn for_message(client: &str, message: &InboundMessage) -> Self {
        match message.channel() {
            Some(channel) => Self::channel(client, channel),
            None => Self::connection(client),
        }
    }

    pub fn scope(&self) -> Scope {
        match self {
            Self::Global => Scope::Global,
            Self::Connection(_) => Scope::Connection,
            Self::Channel(..) => Scope::Channel,
        }
    }

    pub fn client(&self) -> Option<&str> {
        match self {
            Self::Global => None,
            Self::Connection(client) | Self::Channel(client, _) => Some(client),
        }
    }

    pub fn channel_name(&self) -> Option<&str> {
        match self {
            Self::Channel(_, channel) => Some(channel),
            _ => None,
        }
    }

    /// Whether `self` is `other` or a broader context containing it.
    pub fn contains(&self, other: &ContextKey) -> bool {
        match (self, other) {
            (Self::Global, _) => true,
            (Self::Connection(a), Self::Connection(b) | Self::Channel(b, _)) => a == b,
            (Self::Channel(a, x), Self::Channel(b, y)) => a == b && x == y,
            _ => false,
        }
    }

    /// Store path segments below the extension name.
    pub fn store_path(&self) -> Vec<String> {
        match self {
            Self::Global => Vec::new(),
            Self::Connection(client) => vec![client.clone()],
            Self::Channel(client, channel) => vec![client.clone(), channel.clone()],
        }
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Connection(client) => write!(f, "{client}"),
            Self::Channel(client, channel) => write!(f, "{client}/{channel}"),
        }
    }
}
