use serde::{Deserialize, Serialize};

/// Whether `target` names a channel rather than a user.
pub fn is_channel_name(target: &str) -> bool {
    target.starts_with('#') || target.starts_with('&')
}

/// A text message received from the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Sender's identity.
    pub sender: String,
    /// Full sender mask (`nick!user@host`) when the network provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_mask: Option<String>,
    /// A channel, or our own identity for private messages.
    pub target: String,
    pub text: String,
}

impl InboundMessage {
    pub fn new(sender: impl Into<String>, target: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            sender_mask: None,
            target: target.into(),
            text: text.into(),
        }
    }

    /// The channel for channel messages, otherwise the sender.
    pub fn reply_target(&self) -> &str {
        if self.is_channel() {
            &self.target
        } else {
            &self.sender
        }
    }

    pub fn is_channel(&self) -> bool {
        is_channel_name(&self.target)
    }

    /// The channel this message was sent to, if any.
    pub fn channel(&self) -> Option<&str> {
        self.is_channel().then_some(self.target.as_str())
    }
}

/// Inbound events broadcast by a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Message(InboundMessage),
    Joined { channel: String, who: String },
    Parted { channel: String, who: String },
    /// `who` left the network.
    Quit { who: String, reason: String },
    Renamed { from: String, to: String },
    /// The member list of `channel` has been (re)loaded.
    NamesSynced { channel: String },
}

impl Event {
    /// Events that may change who is visible in our channels.
    pub fn is_membership_change(&self) -> bool {
        !matches!(self, Self::Message(_))
    }
}
