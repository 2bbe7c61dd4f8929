//! Chat commands for managing extensions at runtime.

use std::sync::Arc;

use {anyhow::Context as _, async_trait::async_trait};

use warden_config::ExtensionSpec;

use crate::{
    commands::CommandPattern,
    context::{ContextKey, Scope},
    error::Error,
    extension::{
        ClientHandle, CommandCall, CommandResult, Extension, ExtensionContext, ExtensionFactory,
    },
    registry::ExtensionRegistry,
};

pub struct PlugOpsFactory;

impl ExtensionFactory for PlugOpsFactory {
    fn name(&self) -> &str {
        "plugops"
    }

    fn scope(&self) -> Scope {
        Scope::Connection
    }

    fn description(&self) -> &str {
        "Load, unload, enable and disable extensions"
    }

    fn create(&self, context: Arc<ExtensionContext>) -> anyhow::Result<Arc<dyn Extension>> {
        Ok(Arc::new(PlugOps { context }))
    }
}

struct PlugOps {
    context: Arc<ExtensionContext>,
}

#[derive(Default)]
struct Report {
    done: Vec<String>,
    failed: Vec<String>,
}

impl Report {
    fn record(&mut self, verb: &str, name: &str, outcome: Result<(), Error>) {
        match outcome {
            Ok(()) => self.done.push(format!("'{name}'")),
            Err(e) => self
                .failed
                .push(format!("Failed to {verb} extension '{name}': {e}")),
        }
    }

    async fn send(self, call: &CommandCall, past: &str) -> anyhow::Result<()> {
        for line in &self.failed {
            call.reply(line).await?;
        }
        if !self.done.is_empty() {
            call.reply(&format!("{past} extension(s): {}", self.done.join(", ")))
                .await?;
        }
        Ok(())
    }
}

/// Where an extension of `scope` lands when enabled from `call`.
fn target_for(
    scope: Scope,
    call: &CommandCall,
) -> Result<(ContextKey, Option<&ClientHandle>), Error> {
    let client = &call.client;
    match scope {
        Scope::Global => Ok((ContextKey::Global, None)),
        Scope::Connection => Ok((ContextKey::connection(&client.name), Some(client))),
        Scope::Channel => match call.message.channel() {
            Some(channel) => Ok((ContextKey::channel(&client.name, channel), Some(client))),
            None => Err(Error::message("channel extensions must be enabled from a channel")),
        },
    }
}

impl PlugOps {
    fn registry(&self) -> anyhow::Result<Arc<ExtensionRegistry>> {
        self.context.registry().context("registry is gone")
    }

    async fn enable(&self, registry: &ExtensionRegistry, call: &CommandCall) -> Report {
        let mut report = Report::default();
        for raw in &call.args {
            let spec: ExtensionSpec = match raw.parse() {
                Ok(spec) => spec,
                Err(e) => {
                    report.failed.push(format!("Failed to enable extension '{raw}': {e}"));
                    continue;
                },
            };
            let outcome = async {
                let scope = registry
                    .scope_of(&spec.name)
                    .ok_or_else(|| Error::not_loaded(&spec.name))?;
                let (key, client) = target_for(scope, call)?;
                registry.enable(&spec.name, key, client, &spec.args).await?;
                Ok::<(), Error>(())
            }
            .await;
            report.record("enable", &spec.name, outcome);
        }
        report
    }

    async fn disable(&self, registry: &ExtensionRegistry, call: &CommandCall) -> Report {
        let mut report = Report::default();
        for name in &call.args {
            // Disabling something that isn't loaded is not worth a reply.
            let Some(scope) = registry.scope_of(name) else {
                continue;
            };
            let outcome = async {
                let (key, _) = target_for(scope, call)?;
                registry.disable(name, &key).await
            }
            .await;
            report.record("disable", name, outcome);
        }
        report
    }
}

#[async_trait]
impl Extension for PlugOps {
    fn commands(&self) -> Vec<CommandPattern> {
        vec![
            CommandPattern::new("plugin load", 1)
                .summary("Load extensions from the search path")
                .usage("<name>..."),
            CommandPattern::new("plugin unload", 1)
                .summary("Unload extensions that are no longer enabled anywhere")
                .usage("<name>..."),
            CommandPattern::new("plugin reload", 1)
                .summary("Unload then load extensions again")
                .usage("<name>..."),
            CommandPattern::new("plugin enable", 1)
                .summary("Enable loaded extensions here")
                .usage("<name[:arg,...]>..."),
            CommandPattern::new("plugin disable", 1)
                .summary("Disable extensions here")
                .usage("<name>..."),
            CommandPattern::new("plugin list", 0).summary("Show loaded and enabled extensions"),
        ]
    }

    async fn command(&self, call: &CommandCall) -> CommandResult {
        let registry = self.registry()?;
        match call.name().as_str() {
            "plugin load" => {
                let mut report = Report::default();
                for name in &call.args {
                    report.record("load", name, registry.load(name));
                }
                report.send(call, "Loaded").await?;
            },
            "plugin unload" => {
                let mut report = Report::default();
                for name in &call.args {
                    if !registry.is_loaded(name) {
                        call.reply(&format!("No such extension '{name}' is loaded"))
                            .await?;
                        continue;
                    }
                    report.record("unload", name, registry.unload(name));
                }
                report.send(call, "Unloaded").await?;
            },
            "plugin reload" => {
                let mut report = Report::default();
                for name in &call.args {
                    report.record("reload", name, registry.reload(name));
                }
                report.send(call, "Reloaded").await?;
            },
            "plugin enable" => self.enable(&registry, call).await.send(call, "Enabled").await?,
            "plugin disable" => self.disable(&registry, call).await.send(call, "Disabled").await?,
            "plugin list" => {
                call.reply(&format!("Loaded: {}", registry.loaded().join(", ")))
                    .await?;
                let here: Vec<String> = registry
                    .enabled_for(&call.context_key())
                    .iter()
                    .map(|i| format!("{} ({})", i.name, i.key))
                    .collect();
                call.reply(&format!("Enabled here: {}", here.join(", "))).await?;
            },
            other => return Err(anyhow::anyhow!("unexpected command '{other}'").into()),
        }
        Ok(())
    }
}
