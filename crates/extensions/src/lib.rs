//! Extension system: loading, per-context activation, command routing and
//! the extensions bundled with the bot.
//!
//! Extensions are loaded by name from an ordered list of
//! [`ExtensionSource`]s and enabled per [`ContextKey`] (global, one
//! connection, or one channel of a connection). Each enabled instance gets
//! its own store namespace and cancellation token; both die when the
//! instance is disabled.

pub mod bundled;
pub mod commands;
pub mod context;
pub mod error;
pub mod extension;
pub mod registry;
pub mod source;

#[cfg(test)]
mod testing;

pub use {
    commands::{CallbackTasks, CommandPattern, Routed, deliver_event, dispatch},
    context::{ContextKey, Scope},
    error::{Error, Result},
    extension::{
        ClientControl, ClientHandle, CommandCall, CommandError, CommandMiss, CommandResult,
        Extension, ExtensionContext, ExtensionFactory,
    },
    registry::{ExtensionInstance, ExtensionRegistry},
    source::{BundledSource, ExtensionSource, StaticSource},
};
