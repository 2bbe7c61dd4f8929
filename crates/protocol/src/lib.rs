//! Client-library contract between the supervisor and a chat network.
//!
//! A [`Dialer`] opens (or resumes) a [`Connection`]; the connection exposes
//! its identity and channel membership, accepts outbound commands and
//! broadcasts inbound [`Event`]s. Concrete networks live in their own crates;
//! [`memory::MemoryNetwork`] is an in-process network used by tests.

pub mod connection;
pub mod error;
pub mod event;
pub mod gating;
pub mod handoff;
pub mod memory;

pub use {
    connection::{Connection, ConnectionEnd, DialParams, Dialer},
    error::{Error, Result},
    event::{Event, InboundMessage, is_channel_name},
    handoff::HandoffState,
};
