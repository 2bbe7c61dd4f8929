//! Shared error definitions and helpers used across all warden crates.

pub mod error;

pub use error::{Error, FromMessage, Result};
