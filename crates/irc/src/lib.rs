//! Minimal plain-text IRC client implementing the `warden-protocol`
//! connection contract.
//!
//! Registration (PASS/NICK/USER), PING handling, channel membership tracking
//! from JOIN/PART/KICK/QUIT/NICK and NAMES replies, and socket handoff across
//! process images. TLS and SASL are not supported.

pub mod codec;
pub mod connection;
mod fd;
pub mod message;
pub mod state;

pub use {
    connection::{IrcConnection, IrcDialer},
    message::Message,
};
