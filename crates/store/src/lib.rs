//! Small persistent key/value store for extension state.
//!
//! The whole store is one JSON document. Each extension instance works in a
//! namespace nested under its extension name, then its connection, then its
//! channel, so state survives disable/enable and process restarts.

pub mod error;
pub mod namespace;
pub mod store_file;

pub use {
    error::{Error, Result},
    namespace::StoreNamespace,
    store_file::JsonStore,
};
