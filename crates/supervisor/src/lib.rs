//! Connection supervision for the warden bot.
//!
//! A [`Host`] owns the [`SupervisorTable`] and runs one [`supervisor`] task
//! per configured client. Each supervisor dials (or resumes) its
//! connection, enables the client's extensions, pumps inbound events into
//! the extension registry and reconnects with exponential [`backoff`] when
//! the connection ends. [`handoff`] packages live connections so a new
//! process image can adopt them without reconnecting.

pub mod backoff;
pub mod error;
pub mod handoff;
pub mod host;
mod pump;
pub mod supervisor;
pub mod table;

pub use {
    backoff::Backoff,
    error::{Error, Result},
    handoff::{HANDOFF_ENV, HandoffPackage},
    host::{Host, HostExit, HostLink, HostRequest},
    supervisor::{SupervisorDeps, SupervisorHandle, SupervisorState},
    table::SupervisorTable,
};
