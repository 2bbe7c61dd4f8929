//! Administrative control over the current client's connection.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    commands::CommandPattern,
    context::Scope,
    extension::{CommandCall, CommandResult, Extension, ExtensionContext, ExtensionFactory},
};

pub struct ClientOpsFactory;

impl ExtensionFactory for ClientOpsFactory {
    fn name(&self) -> &str {
        "clientops"
    }

    fn scope(&self) -> Scope {
        Scope::Connection
    }

    fn description(&self) -> &str {
        "Restart the current connection"
    }

    fn create(&self, _context: Arc<ExtensionContext>) -> anyhow::Result<Arc<dyn Extension>> {
        Ok(Arc::new(ClientOps))
    }
}

struct ClientOps;

#[async_trait]
impl Extension for ClientOps {
    fn commands(&self) -> Vec<CommandPattern> {
        vec![CommandPattern::new("restart", 0).summary("Reconnect this client")]
    }

    async fn command(&self, call: &CommandCall) -> CommandResult {
        let reason = format!("Reconnecting (administrative restart by {})", call.sender());
        if !call.client.control.restart(&reason) {
            call.reply("Client is not in a state that can be restarted")
                .await?;
        }
        Ok(())
    }
}
