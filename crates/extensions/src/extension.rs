//! The extension contract: factories, live instances and what they get to
//! see of the running bot.

use std::{
    fmt,
    sync::{Arc, Weak},
};

use {
    async_trait::async_trait,
    serde::de::DeserializeOwned,
    serde_json::Value,
    tokio_util::sync::CancellationToken,
};

use {
    warden_config::{ClientConfig, ConfigHandle},
    warden_protocol::{Connection, Event, InboundMessage},
    warden_store::StoreNamespace,
};

use crate::{
    commands::CommandPattern,
    context::{ContextKey, Scope},
    registry::ExtensionRegistry,
};

/// Lifecycle requests an extension may make of the client it runs under.
pub trait ClientControl: Send + Sync {
    /// Restart the client's connection. Returns `false` when the client is
    /// not in a state that can be restarted.
    fn restart(&self, reason: &str) -> bool;

    /// Ask the host to hand every connection to a new process image.
    fn request_handoff(&self) -> bool;

    /// Ask the host to quit every connection and exit.
    fn request_shutdown(&self, reason: &str);
}

/// The running client a command or event arrived through.
#[derive(Clone)]
pub struct ClientHandle {
    pub name: String,
    pub connection: Arc<dyn Connection>,
    pub control: Arc<dyn ClientControl>,
    pub config: Arc<ClientConfig>,
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("name", &self.name)
            .field("identity", &self.connection.identity())
            .finish_non_exhaustive()
    }
}

/// Everything an instance is constructed with.
pub struct ExtensionContext {
    pub name: String,
    pub key: ContextKey,
    pub args: Vec<String>,
    /// Present for connection and channel scoped instances.
    pub client: Option<ClientHandle>,
    pub config: ConfigHandle,
    /// Persistent state, unusable once the instance is disabled.
    pub store: StoreNamespace,
    /// Global `[extension.<name>]` settings merged with the client's own.
    pub settings: Value,
    /// Cancelled when the instance is disabled. Background tasks must stop.
    pub cancel: CancellationToken,
    pub(crate) registry: Weak<ExtensionRegistry>,
}

impl ExtensionContext {
    /// The registry this instance lives in, while it still exists.
    pub fn registry(&self) -> Option<Arc<ExtensionRegistry>> {
        self.registry.upgrade()
    }

    /// Deserialize the whole settings table, falling back to defaults.
    pub fn settings_as<T: DeserializeOwned + Default>(&self) -> T {
        match serde_json::from_value(self.settings.clone()) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(extension = %self.name, error = %e, "invalid extension settings, using defaults");
                T::default()
            },
        }
    }
}

/// A command invocation routed to one instance.
#[derive(Clone)]
pub struct CommandCall {
    pub client: ClientHandle,
    pub message: InboundMessage,
    pub command: CommandPattern,
    /// Words after the command words, original case.
    pub args: Vec<String>,
}

impl CommandCall {
    /// Full command name, e.g. `plugin load`.
    pub fn name(&self) -> String {
        self.command.name()
    }

    pub fn sender(&self) -> &str {
        &self.message.sender
    }

    /// Narrowest context the command was issued in.
    pub fn context_key(&self) -> ContextKey {
        ContextKey::for_message(&self.client.name, &self.message)
    }

    /// Reply to the channel, or to the sender for private messages.
    pub async fn reply(&self, text: &str) -> anyhow::Result<()> {
        self.client
            .connection
            .send(self.message.reply_target(), text)
            .await?;
        Ok(())
    }
}

/// A message that started with the command prefix but matched no pattern.
pub struct CommandMiss {
    pub client: ClientHandle,
    pub message: InboundMessage,
    /// Lower-cased words after the prefix.
    pub words: Vec<String>,
    /// Every pattern visible where the message was sent.
    pub visible: Vec<CommandPattern>,
    /// Names of the instances visible there.
    pub extensions: Vec<String>,
}

impl CommandMiss {
    pub async fn reply(&self, text: &str) -> anyhow::Result<()> {
        self.client
            .connection
            .send(self.message.reply_target(), text)
            .await?;
        Ok(())
    }
}

/// Why a command callback did not complete.
#[derive(Debug)]
pub enum CommandError {
    /// Wrong arguments. Carries a usage hint overriding the pattern's own.
    Usage(Option<String>),
    Failed(anyhow::Error),
}

impl From<anyhow::Error> for CommandError {
    fn from(e: anyhow::Error) -> Self {
        Self::Failed(e)
    }
}

macro_rules! command_error_from {
    ($($ty:ty),+ $(,)?) => {
        $(impl From<$ty> for CommandError {
            fn from(e: $ty) -> Self {
                Self::Failed(e.into())
            }
        })+
    };
}

command_error_from!(
    crate::Error,
    warden_config::Error,
    warden_protocol::Error,
    warden_store::Error,
);

pub type CommandResult = Result<(), CommandError>;

/// One enabled extension instance.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Patterns this instance answers to, in registration order.
    fn commands(&self) -> Vec<CommandPattern> {
        Vec::new()
    }

    /// Runs after construction. An error aborts the enable.
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn command(&self, call: &CommandCall) -> CommandResult {
        Err(CommandError::Failed(anyhow::anyhow!(
            "no handler for '{}'",
            call.name()
        )))
    }

    /// Sees every inbound event visible to this instance, before routing.
    async fn event(&self, _client: &ClientHandle, _event: &Event) {}

    /// Observes prefixed messages that matched no command.
    async fn no_match(&self, _miss: &CommandMiss) {}

    /// Runs once when the instance is disabled, after its token is cancelled.
    async fn cleanup(&self) {}
}

/// Builds instances of one named extension.
pub trait ExtensionFactory: Send + Sync {
    fn name(&self) -> &str;

    fn scope(&self) -> Scope;

    fn description(&self) -> &str {
        ""
    }

    fn create(&self, context: Arc<ExtensionContext>) -> anyhow::Result<Arc<dyn Extension>>;
}
