//! Lists visible commands and shows their help text.

use std::sync::Arc;

use {anyhow::Context as _, async_trait::async_trait, serde::Deserialize};

use crate::{
    commands::CommandPattern,
    context::Scope,
    extension::{CommandCall, CommandResult, Extension, ExtensionContext, ExtensionFactory},
};

#[derive(Debug, Deserialize)]
#[serde(default)]
struct HelpSettings {
    /// Above this many matches the listing collapses to a single line.
    max_lines: usize,
}

impl Default for HelpSettings {
    fn default() -> Self {
        Self { max_lines: 10 }
    }
}

pub struct HelpFactory;

impl ExtensionFactory for HelpFactory {
    fn name(&self) -> &str {
        "help"
    }

    fn scope(&self) -> Scope {
        Scope::Connection
    }

    fn description(&self) -> &str {
        "List commands and show their help"
    }

    fn create(&self, context: Arc<ExtensionContext>) -> anyhow::Result<Arc<dyn Extension>> {
        let settings = context.settings_as();
        Ok(Arc::new(Help { context, settings }))
    }
}

struct Help {
    context: Arc<ExtensionContext>,
    settings: HelpSettings,
}

impl Help {
    /// Commands visible where `call` was issued, sorted and deduplicated.
    fn visible(&self, call: &CommandCall) -> anyhow::Result<Vec<CommandPattern>> {
        let registry = self.context.registry().context("registry is gone")?;
        let mut commands: Vec<CommandPattern> = registry
            .enabled_for(&call.context_key())
            .iter()
            .flat_map(|i| i.commands.clone())
            .collect();
        commands.sort_by(|a, b| a.words.cmp(&b.words));
        commands.dedup_by(|a, b| a.words == b.words);
        Ok(commands)
    }
}

#[async_trait]
impl Extension for Help {
    fn commands(&self) -> Vec<CommandPattern> {
        vec![
            CommandPattern::new("help", 0)
                .summary("List commands, or show help for one")
                .help("List commands matching the given words.\nWith a single match, show its full help.")
                .usage("[command]"),
        ]
    }

    async fn command(&self, call: &CommandCall) -> CommandResult {
        let query: Vec<String> = call.args.iter().map(|w| w.to_lowercase()).collect();
        let matching: Vec<CommandPattern> = self
            .visible(call)?
            .into_iter()
            .filter(|c| c.words.starts_with(&query))
            .collect();

        match matching.as_slice() {
            [] => {
                call.reply(&format!("No commands matching '{}' found", query.join(" ")))
                    .await?;
            },
            [only] => {
                let name = only.name();
                match only.help.as_ref().or(only.summary.as_ref()) {
                    None => {
                        call.reply(&format!("Command '{name}' has no help available"))
                            .await?;
                    },
                    Some(text) => {
                        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                            call.reply(line).await?;
                        }
                    },
                }
            },
            many if many.len() > self.settings.max_lines => {
                let names: Vec<String> = many.iter().map(CommandPattern::name).collect();
                call.reply(&format!("Commands: {}", names.join(", "))).await?;
            },
            many => {
                for command in many {
                    let summary = command.summary.as_deref().unwrap_or("(no help available)");
                    call.reply(&format!("{} - {summary}", command.name())).await?;
                }
            },
        }
        Ok(())
    }
}
