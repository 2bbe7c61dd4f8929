#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::{sync::Arc, time::Duration};

use {async_trait::async_trait, serde_json::json, tokio::sync::broadcast};

use {
    warden_config::{ClientEntry, ClientOptions, ConfigHandle, WardenConfig},
    warden_extensions::{
        BundledSource, CommandCall, CommandPattern, CommandResult, ContextKey, Extension,
        ExtensionContext, ExtensionFactory, ExtensionRegistry, ExtensionSource, Scope,
        StaticSource,
    },
    warden_protocol::{Connection, DialParams, Dialer, Event, memory::MemoryNetwork},
    warden_store::JsonStore,
    warden_supervisor::{Host, SupervisorHandle, SupervisorState},
};

pub struct Harness {
    pub network: MemoryNetwork,
    pub config: ConfigHandle,
    pub registry: Arc<ExtensionRegistry>,
    pub host: Host,
}

impl Harness {
    pub fn handle(&self, client: &str) -> SupervisorHandle {
        self.host.table().get(client).expect("supervisor is running")
    }

    /// Whether `extension` is enabled on `client`'s connection.
    pub fn enabled_on(&self, extension: &str, client: &str) -> bool {
        self.registry
            .instance(extension, &ContextKey::connection(client))
            .is_some()
    }
}

/// Test-only extension whose `stall` command waits two seconds, then
/// enables `echo` on the connection it was issued on.
struct StallFactory;

impl ExtensionFactory for StallFactory {
    fn name(&self) -> &str {
        "stall"
    }

    fn scope(&self) -> Scope {
        Scope::Connection
    }

    fn create(&self, context: Arc<ExtensionContext>) -> anyhow::Result<Arc<dyn Extension>> {
        Ok(Arc::new(Stall { context }))
    }
}

struct Stall {
    context: Arc<ExtensionContext>,
}

#[async_trait]
impl Extension for Stall {
    fn commands(&self) -> Vec<CommandPattern> {
        vec![CommandPattern::new("stall", 0)]
    }

    async fn command(&self, call: &CommandCall) -> CommandResult {
        tokio::time::sleep(Duration::from_secs(2)).await;
        let registry = self.context.registry().expect("registry alive");
        registry.load("echo")?;
        registry
            .enable(
                "echo",
                ContextKey::connection(&call.client.name),
                Some(&call.client),
                &[],
            )
            .await?;
        Ok(())
    }
}

pub fn client(name: &str, nick: &str, extensions: &[&str]) -> ClientEntry {
    ClientEntry {
        name: name.into(),
        options: ClientOptions {
            host: Some("memory".into()),
            nick: Some(nick.into()),
            channels: Some(vec!["#ops".into()]),
            extensions: Some(extensions.iter().map(|e| e.to_string()).collect()),
            ..ClientOptions::default()
        },
    }
}

pub fn config(clients: Vec<ClientEntry>) -> WardenConfig {
    WardenConfig {
        clients,
        ..WardenConfig::default()
    }
}

/// Leader settings fast enough for tests, guarding `echo`.
pub fn with_fast_leader(mut config: WardenConfig) -> WardenConfig {
    config.extension.insert(
        "leader".into(),
        json!({ "poll_interval_secs": 0.05, "jitter_ms": 0, "guarded": ["echo"] }),
    );
    config
}

pub fn harness(config: WardenConfig) -> Harness {
    harness_on(&MemoryNetwork::new(), config)
}

/// A fresh host and registry sharing `network`, as a new process image would.
pub fn harness_on(network: &MemoryNetwork, config: WardenConfig) -> Harness {
    let config = ConfigHandle::new(config, None);
    let extras = StaticSource::new("test");
    extras.insert(Arc::new(StallFactory));
    let sources: Vec<Arc<dyn ExtensionSource>> = vec![Arc::new(BundledSource), Arc::new(extras)];
    let registry = ExtensionRegistry::new(sources, JsonStore::in_memory(), config.clone());
    let host = Host::new(
        config.clone(),
        Arc::clone(&registry),
        Arc::new(network.clone()),
    );
    Harness {
        network: network.clone(),
        config,
        registry,
        host,
    }
}

pub async fn wait_state(handle: &SupervisorHandle, state: SupervisorState) {
    let mut states = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(30), states.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("{} never reached {state}", handle.name()))
        .unwrap();
}

/// Poll `condition` until it holds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..1500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// A plain network user, joined to `#ops`.
pub async fn peer(
    network: &MemoryNetwork,
    nick: &str,
) -> (Arc<dyn Connection>, broadcast::Receiver<Event>) {
    let connection = network
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
    connection.join("#ops").await.unwrap();
    (connection, events)
}

/// Next message text seen by a peer.
pub async fn recv_text(events: &mut broadcast::Receiver<Event>) -> String {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Event::Message(message) = events.recv().await.unwrap() {
                return message.text;
            }
        }
    })
    .await
    .expect("no message within 5s")
}
