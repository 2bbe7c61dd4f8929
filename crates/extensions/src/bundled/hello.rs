//! Greets whoever asks. Global, so it answers on every connection.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    commands::CommandPattern,
    context::Scope,
    extension::{CommandCall, CommandResult, Extension, ExtensionContext, ExtensionFactory},
};

pub struct HelloFactory;

impl ExtensionFactory for HelloFactory {
    fn name(&self) -> &str {
        "hello"
    }

    fn scope(&self) -> Scope {
        Scope::Global
    }

    fn description(&self) -> &str {
        "Say hello"
    }

    fn create(&self, _context: Arc<ExtensionContext>) -> anyhow::Result<Arc<dyn Extension>> {
        Ok(Arc::new(Hello))
    }
}

struct Hello;

#[async_trait]
impl Extension for Hello {
    fn commands(&self) -> Vec<CommandPattern> {
        vec![CommandPattern::new("hello", 0).summary("Say hello")]
    }

    async fn command(&self, call: &CommandCall) -> CommandResult {
        call.reply(&format!("Hello, {}!", call.sender())).await?;
        Ok(())
    }
}
