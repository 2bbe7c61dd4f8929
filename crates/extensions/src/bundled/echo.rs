//! Repeats its arguments back.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    commands::CommandPattern,
    context::Scope,
    extension::{CommandCall, CommandResult, Extension, ExtensionContext, ExtensionFactory},
};

pub struct EchoFactory;

impl ExtensionFactory for EchoFactory {
    fn name(&self) -> &str {
        "echo"
    }

    fn scope(&self) -> Scope {
        Scope::Connection
    }

    fn description(&self) -> &str {
        "Repeat text back"
    }

    fn create(&self, _context: Arc<ExtensionContext>) -> anyhow::Result<Arc<dyn Extension>> {
        Ok(Arc::new(Echo))
    }
}

struct Echo;

#[async_trait]
impl Extension for Echo {
    fn commands(&self) -> Vec<CommandPattern> {
        vec![
            CommandPattern::new("echo", 1)
                .summary("Repeat text back")
                .usage("<text>"),
        ]
    }

    async fn command(&self, call: &CommandCall) -> CommandResult {
        call.reply(&call.args.join(" ")).await?;
        Ok(())
    }
}
