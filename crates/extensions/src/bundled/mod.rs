//! Extensions shipped with the bot.

use std::sync::Arc;

use crate::extension::ExtensionFactory;

pub mod clientops;
pub mod config_manager;
pub mod didyoumean;
pub mod echo;
pub mod hello;
pub mod help;
pub mod leader;
pub mod plugops;
pub mod processops;

pub fn factories() -> Vec<Arc<dyn ExtensionFactory>> {
    vec![
        Arc::new(clientops::ClientOpsFactory),
        Arc::new(config_manager::ConfigManagerFactory),
        Arc::new(didyoumean::DidYouMeanFactory),
        Arc::new(echo::EchoFactory),
        Arc::new(hello::HelloFactory),
        Arc::new(help::HelpFactory),
        Arc::new(leader::LeaderFactory),
        Arc::new(plugops::PlugOpsFactory),
        Arc::new(processops::ProcessOpsFactory),
    ]
}
