#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Shared fixtures for unit tests: a memory network, a registry with the
//! bundled extensions plus a swappable source, and a recorder extension that
//! records what happens to it.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use {async_trait::async_trait, tokio::sync::broadcast};

use {
    warden_config::{ClientEntry, ClientOptions, ConfigHandle, WardenConfig},
    warden_protocol::{
        Connection, DialParams, Dialer, Event, InboundMessage, memory::MemoryNetwork,
    },
    warden_store::JsonStore,
};

use crate::{
    commands::{CallbackTasks, CommandPattern, Routed, dispatch},
    context::{ContextKey, Scope},
    extension::{
        ClientControl, ClientHandle, CommandCall, CommandError, CommandResult, Extension,
        ExtensionContext, ExtensionFactory,
    },
    registry::ExtensionRegistry,
    source::{BundledSource, ExtensionSource, StaticSource},
};

type Journal = Arc<Mutex<Vec<(String, String)>>>;

#[derive(Default)]
pub struct RecordingControl {
    pub restarts: Mutex<Vec<String>>,
    pub handoffs: AtomicUsize,
    pub shutdowns: Mutex<Vec<String>>,
}

impl ClientControl for RecordingControl {
    fn restart(&self, reason: &str) -> bool {
        self.restarts.lock().unwrap().push(reason.to_string());
        true
    }

    fn request_handoff(&self) -> bool {
        self.handoffs.fetch_add(1, Ordering::SeqCst) == 0
    }

    fn request_shutdown(&self, reason: &str) {
        self.shutdowns.lock().unwrap().push(reason.to_string());
    }
}

/// Extension that journals every callback.
pub struct Recorder {
    name: String,
    scope: Scope,
    fail_start: bool,
    commands: Vec<CommandPattern>,
    journal: Journal,
}

impl Recorder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            scope: Scope::Connection,
            fail_start: false,
            commands: Vec::new(),
            journal: Journal::default(),
        }
    }

    pub fn scoped(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn with_commands(mut self, commands: Vec<CommandPattern>) -> Self {
        self.commands = commands;
        self
    }
}

impl ExtensionFactory for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    fn scope(&self) -> Scope {
        self.scope
    }

    fn create(&self, context: Arc<ExtensionContext>) -> anyhow::Result<Arc<dyn Extension>> {
        Ok(Arc::new(RecorderInstance {
            context,
            fail_start: self.fail_start,
            commands: self.commands.clone(),
            journal: Arc::clone(&self.journal),
        }))
    }
}

struct RecorderInstance {
    context: Arc<ExtensionContext>,
    fail_start: bool,
    commands: Vec<CommandPattern>,
    journal: Journal,
}

impl RecorderInstance {
    fn note(&self, entry: String) {
        self.journal
            .lock()
            .unwrap()
            .push((self.context.name.clone(), entry));
    }
}

#[async_trait]
impl Extension for RecorderInstance {
    fn commands(&self) -> Vec<CommandPattern> {
        self.commands.clone()
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.fail_start {
            anyhow::bail!("refusing to start");
        }
        self.note(format!("start {}", self.context.key));
        Ok(())
    }

    async fn command(&self, call: &CommandCall) -> CommandResult {
        match call.name().as_str() {
            "usage" => return Err(CommandError::Usage(None)),
            "fail" => return Err(anyhow::anyhow!("requested failure").into()),
            "boom" => panic!("recorder exploded"),
            "slow" => tokio::time::sleep(Duration::from_millis(300)).await,
            _ => {},
        }
        self.note(format!(
            "{} {} [{}]",
            self.context.key,
            call.name(),
            call.args.join(" ")
        ));
        Ok(())
    }

    async fn event(&self, _client: &ClientHandle, event: &Event) {
        let kind = match event {
            Event::Message(_) => "message",
            Event::Joined { .. } => "joined",
            Event::Parted { .. } => "parted",
            Event::Quit { .. } => "quit",
            Event::Renamed { .. } => "renamed",
            Event::NamesSynced { .. } => "names",
        };
        self.note(format!("{} event {kind}", self.context.key));
    }

    async fn cleanup(&self) {
        self.note(format!("cleanup {}", self.context.key));
    }
}

pub struct Fixture {
    pub network: MemoryNetwork,
    pub registry: Arc<ExtensionRegistry>,
    pub source: Arc<StaticSource>,
    pub client: ClientHandle,
    pub control: Arc<RecordingControl>,
    pub config: ConfigHandle,
    pub callbacks: Arc<CallbackTasks>,
    journal: Journal,
}

pub fn test_config() -> WardenConfig {
    WardenConfig {
        clients: vec![ClientEntry {
            name: "main".into(),
            options: ClientOptions {
                host: Some("memory".into()),
                nick: Some("warden".into()),
                channels: Some(vec!["#ops".into()]),
                ignore: Some(vec!["spammer".into()]),
                ..ClientOptions::default()
            },
        }],
        ..WardenConfig::default()
    }
}

pub async fn fixture() -> Fixture {
    fixture_with(test_config()).await
}

pub async fn fixture_with(config: WardenConfig) -> Fixture {
    let config = ConfigHandle::new(config, None);
    let client_config = Arc::new(config.client("main").unwrap());
    let network = MemoryNetwork::new();
    let connection = network
        .dial(&DialParams {
            client: "main".into(),
            host: client_config.host.clone(),
            port: client_config.port,
            password: None,
            nick: client_config.nick.clone(),
            ident: client_config.ident.clone(),
            real_name: client_config.real_name.clone(),
        })
        .await
        .unwrap();
    let control = Arc::new(RecordingControl::default());
    let client = ClientHandle {
        name: "main".into(),
        connection,
        control: Arc::clone(&control) as Arc<dyn ClientControl>,
        config: client_config,
    };

    let journal = Journal::default();
    let source = Arc::new(StaticSource::new("test"));
    let recorder = Recorder {
        journal: Arc::clone(&journal),
        ..Recorder::new("recorder")
    };
    source.insert(Arc::new(recorder));
    let sources: Vec<Arc<dyn ExtensionSource>> = vec![Arc::new(BundledSource), source.clone()];
    let registry = ExtensionRegistry::new(sources, JsonStore::in_memory(), config.clone());

    Fixture {
        network,
        registry,
        source,
        client,
        control,
        config,
        callbacks: Arc::new(CallbackTasks::new()),
        journal,
    }
}

impl Fixture {
    /// Register a recorder sharing this fixture's journal.
    pub fn add(&self, recorder: Recorder) {
        self.source.insert(Arc::new(Recorder {
            journal: Arc::clone(&self.journal),
            ..recorder
        }));
    }

    /// Load `name` and enable it on the fixture's connection.
    pub async fn enable_here(&self, name: &str) {
        self.registry.load(name).unwrap();
        self.registry
            .enable(name, ContextKey::connection("main"), Some(&self.client), &[])
            .await
            .unwrap();
    }

    pub async fn enable_global(&self, name: &str) {
        self.registry.load(name).unwrap();
        self.registry
            .enable(name, ContextKey::Global, None, &[])
            .await
            .unwrap();
    }

    /// Everything recorder `name` journaled.
    pub fn log_of(&self, name: &str) -> Vec<String> {
        self.journal
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Command and event entries of recorder `name`.
    pub fn calls_of(&self, name: &str) -> Vec<String> {
        self.log_of(name)
            .into_iter()
            .filter(|e| !is_lifecycle(e))
            .collect()
    }

    /// Recorder names in the order their non-lifecycle entries were written.
    pub fn journal_names(&self) -> Vec<String> {
        self.journal
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| !is_lifecycle(e))
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub async fn route(&self, sender: &str, target: &str, text: &str) -> Routed {
        let message = InboundMessage::new(sender, target, text);
        dispatch(&self.registry, &self.callbacks, &self.client, &message).await
    }

    pub async fn route_from(&self, peer: &Arc<dyn Connection>, target: &str, text: &str) -> Routed {
        self.route(&peer.identity(), target, text).await
    }

    /// Another user on the network, with a subscription to what it receives.
    pub async fn peer(&self, nick: &str) -> (Arc<dyn Connection>, broadcast::Receiver<Event>) {
        let connection = self
            .network
            .dial(&DialParams {
                client: nick.into(),
                host: "memory".into(),
                port: 6667,
                password: None,
                nick: nick.into(),
                ident: nick.into(),
                real_name: nick.into(),
            })
            .await
            .unwrap();
        let events = connection.subscribe();
        (connection, events)
    }
}

fn is_lifecycle(entry: &str) -> bool {
    entry.starts_with("start ") || entry.starts_with("cleanup ")
}

/// Next message delivered to a peer.
pub async fn recv_reply(events: &mut broadcast::Receiver<Event>) -> InboundMessage {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Event::Message(message) = events.recv().await.unwrap() {
                return message;
            }
        }
    })
    .await
    .expect("no reply within 2s")
}

/// Collect replies until none arrives for a short while.
pub async fn drain_replies(events: &mut broadcast::Receiver<Event>) -> Vec<String> {
    let mut replies = Vec::new();
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(200), events.recv()).await
    {
        if let Event::Message(message) = event {
            replies.push(message.text);
        }
    }
    replies
}
