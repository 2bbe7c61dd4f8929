//! Read, change and reload configuration from chat.

use std::{path::Path, sync::Arc};

use {async_trait::async_trait, serde_json::Value};

use crate::{
    commands::CommandPattern,
    context::Scope,
    extension::{
        CommandCall, CommandError, CommandResult, Extension, ExtensionContext, ExtensionFactory,
    },
};

pub struct ConfigManagerFactory;

impl ExtensionFactory for ConfigManagerFactory {
    fn name(&self) -> &str {
        "config_manager"
    }

    fn scope(&self) -> Scope {
        Scope::Global
    }

    fn description(&self) -> &str {
        "Inspect and change configuration"
    }

    fn create(&self, context: Arc<ExtensionContext>) -> anyhow::Result<Arc<dyn Extension>> {
        Ok(Arc::new(ConfigManager { context }))
    }
}

struct ConfigManager {
    context: Arc<ExtensionContext>,
}

/// JSON if it parses, otherwise the raw text as a string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[async_trait]
impl Extension for ConfigManager {
    fn commands(&self) -> Vec<CommandPattern> {
        vec![
            CommandPattern::new("config load", 0)
                .summary("Reload the config file, or load another one")
                .usage("[path]"),
            CommandPattern::new("config get", 1)
                .summary("Show a config value")
                .usage("<dotted.key>"),
            CommandPattern::new("config set", 2)
                .summary("Change a config value in memory")
                .usage("<dotted.key> <value>"),
        ]
    }

    async fn command(&self, call: &CommandCall) -> CommandResult {
        let config = &self.context.config;
        match call.name().as_str() {
            "config load" => {
                let path = if call.args.is_empty() {
                    config
                        .source()
                        .ok_or(CommandError::Usage(Some("<path> (no config file in use)".into())))?
                } else {
                    Path::new(&call.args.join(" ")).to_path_buf()
                };
                let shown = path.display();
                match config.load_from(&path) {
                    Ok(()) => call.reply(&format!("Config file '{shown}' loaded")).await?,
                    Err(e) => {
                        call.reply(&format!("Failed to load config file '{shown}': {e}"))
                            .await?;
                    },
                }
            },
            "config get" => {
                let key = &call.args[0];
                match config.get_value(key)? {
                    Some(value) => call.reply(&format!("config.{key} = {value}")).await?,
                    None => call.reply(&format!("config.{key} is not set")).await?,
                }
            },
            "config set" => {
                let key = &call.args[0];
                let raw = call.args[1..].join(" ");
                let value = parse_value(&raw);
                config.set_value(key, value.clone())?;
                call.reply(&format!("set config.{key} = {value}")).await?;
            },
            other => return Err(anyhow::anyhow!("unexpected command '{other}'").into()),
        }
        Ok(())
    }
}
