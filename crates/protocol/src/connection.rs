use std::{fmt, sync::Arc};

use {
    async_trait::async_trait,
    secrecy::{ExposeSecret, Secret},
    tokio::sync::broadcast,
};

use crate::{Event, HandoffState, Result};

/// How a connection finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// We sent a quit.
    Quit,
    /// The socket was packaged for a new process image.
    HandedOff,
    /// The server closed the connection or the transport failed.
    Lost(String),
}

/// One live session on the network.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Name of the configured client owning this connection.
    fn client(&self) -> &str;

    /// Identity currently held on the network.
    fn identity(&self) -> String;

    /// Identity this client would like to hold.
    fn desired_identity(&self) -> String;

    /// Channels we are currently in.
    fn channels(&self) -> Vec<String>;

    /// Known members of `channel`, or `None` if we are not in it.
    fn members(&self, channel: &str) -> Option<Vec<String>>;

    /// Subscribe to inbound events from this point on.
    fn subscribe(&self) -> broadcast::Receiver<Event>;

    async fn send(&self, target: &str, text: &str) -> Result<()>;

    async fn join(&self, channel: &str) -> Result<()>;

    async fn part(&self, channel: &str) -> Result<()>;

    /// Ask the network for a new identity. Fails with
    /// [`crate::Error::IdentityTaken`] when someone else holds it.
    async fn rename(&self, identity: &str) -> Result<()>;

    async fn quit(&self, reason: &str) -> Result<()>;

    /// Stop reading, duplicate the socket and describe the session so a new
    /// process image can resume it. The connection ends as
    /// [`ConnectionEnd::HandedOff`].
    async fn prepare_handoff(&self) -> Result<HandoffState>;

    /// Resolves once the connection has ended.
    async fn closed(&self) -> ConnectionEnd;
}

/// Parameters for opening a connection.
#[derive(Clone)]
pub struct DialParams {
    pub client: String,
    pub host: String,
    pub port: u16,
    pub password: Option<Secret<String>>,
    /// Desired identity.
    pub nick: String,
    pub ident: String,
    pub real_name: String,
}

impl DialParams {
    pub fn password(&self) -> Option<&str> {
        self.password.as_ref().map(|p| p.expose_secret().as_str())
    }
}

impl fmt::Debug for DialParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialParams")
            .field("client", &self.client)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("nick", &self.nick)
            .finish_non_exhaustive()
    }
}

/// Opens connections to a network.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect and register from scratch.
    async fn dial(&self, params: &DialParams) -> Result<Arc<dyn Connection>>;

    /// Adopt a session packaged by [`Connection::prepare_handoff`] in a
    /// previous process image.
    async fn resume(&self, params: &DialParams, state: HandoffState)
    -> Result<Arc<dyn Connection>>;

    /// Release an inherited session nobody will resume.
    fn discard(&self, _state: HandoffState) {}
}
