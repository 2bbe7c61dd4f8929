use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Everything needed to resume one live connection in a new process image
/// without a fresh handshake.
///
/// `fd` is a bare descriptor number, never an owning handle, so nothing in
/// the old image closes it on drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffState {
    pub fd: i32,
    /// Identity held on the network at handoff time.
    pub identity: String,
    pub desired_identity: String,
    pub channels: Vec<String>,
    /// Implementation-specific extras (server name, unread inbound bytes).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Metadata key for inbound bytes read from the socket but not yet parsed.
pub const META_PENDING_INPUT: &str = "pending_input";
/// Metadata key for the server name learned during registration.
pub const META_SERVER: &str = "server";
