//! Packaging live connections for a new process image and re-executing.
//!
//! The package travels in the [`HANDOFF_ENV`] environment variable as JSON.
//! Descriptors named in it are the only ones left open across the exec.

use std::collections::BTreeMap;

use {
    futures::future::join_all,
    serde::{Deserialize, Serialize},
    tracing::{info, warn},
};

use warden_protocol::HandoffState;

use crate::{
    error::{Error, Result},
    table::SupervisorTable,
};

/// Environment variable carrying the handoff package.
pub const HANDOFF_ENV: &str = "WARDEN_HANDOFF";

/// Connections handed from one process image to the next, keyed by client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffPackage {
    pub connections: BTreeMap<String, HandoffState>,
}

impl HandoffPackage {
    /// Read the package left by a previous image, if any. A malformed
    /// package is logged and ignored so startup falls back to fresh dials.
    pub fn from_env() -> Option<Self> {
        let raw = std::env::var(HANDOFF_ENV).ok()?;
        match Self::decode(&raw) {
            Ok(package) => Some(package),
            Err(e) => {
                warn!(error = %e, "ignoring malformed handoff package");
                None
            },
        }
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Descriptors that must survive the exec.
    pub fn fds(&self) -> Vec<i32> {
        self.connections.values().map(|s| s.fd).collect()
    }
}

/// Ask every supervisor to package its connection and wait for all of them
/// to finish. Supervisors that cannot package are stopped; their clients
/// dial from scratch in the next image.
///
/// Fails with [`Error::Unsupported`] off Unix, before any supervisor is
/// touched.
pub async fn collect(table: &SupervisorTable) -> Result<HandoffPackage> {
    if !cfg!(unix) {
        return Err(Error::Unsupported {
            operation: "process handoff",
        });
    }
    let handles = table.handles();
    let results = join_all(handles.iter().map(|h| h.prepare_handoff())).await;

    let mut package = HandoffPackage::default();
    for (handle, result) in handles.iter().zip(results) {
        match result {
            Some(state) => {
                package.connections.insert(handle.name().to_string(), state);
            },
            None => {
                warn!(client = %handle.name(), "no handoff state, client will reconnect");
                handle.stop("Restarting");
            },
        }
    }
    table.wait_empty().await;
    info!(connections = package.connections.len(), "handoff package collected");
    Ok(package)
}

/// Replace the current process image with a fresh copy of the running
/// executable, passing `package` along. Only returns on failure.
#[cfg(unix)]
pub fn reexec(package: &HandoffPackage) -> Result<std::convert::Infallible> {
    use std::{
        ffi::{CString, OsStr},
        os::unix::ffi::OsStrExt,
    };

    use nix::{
        fcntl::{FcntlArg, FdFlag, fcntl},
        unistd::execve,
    };

    fn c_string(bytes: &[u8]) -> Result<CString> {
        CString::new(bytes).map_err(Error::exec)
    }

    let exe = std::env::current_exe()?;
    let path = c_string(exe.as_os_str().as_bytes())?;
    let args = std::env::args_os()
        .map(|a| c_string(a.as_bytes()))
        .collect::<Result<Vec<_>>>()?;

    let encoded = package.encode()?;
    let mut env = Vec::new();
    for (key, value) in std::env::vars_os() {
        if key == OsStr::new(HANDOFF_ENV) {
            continue;
        }
        let mut pair = key.as_bytes().to_vec();
        pair.push(b'=');
        pair.extend_from_slice(value.as_bytes());
        env.push(c_string(&pair)?);
    }
    env.push(c_string(format!("{HANDOFF_ENV}={encoded}").as_bytes())?);

    let keep = package.fds();
    for fd in open_fds() {
        if fd <= 2 {
            continue;
        }
        let flags = if keep.contains(&fd) {
            FdFlag::empty()
        } else {
            FdFlag::FD_CLOEXEC
        };
        if let Err(e) = fcntl(fd, FcntlArg::F_SETFD(flags))
            && keep.contains(&fd)
        {
            return Err(Error::exec(format!("cannot keep fd {fd} open: {e}")));
        }
    }

    info!(exe = %exe.display(), connections = keep.len(), "re-executing");
    execve(&path, &args, &env).map_err(Error::exec)
}

#[cfg(not(unix))]
pub fn reexec(_package: &HandoffPackage) -> Result<std::convert::Infallible> {
    Err(Error::Unsupported {
        operation: "process handoff",
    })
}

/// Descriptors open in this process.
#[cfg(unix)]
fn open_fds() -> Vec<i32> {
    for dir in ["/proc/self/fd", "/dev/fd"] {
        if let Ok(entries) = std::fs::read_dir(dir) {
            let fds: Vec<i32> = entries
                .filter_map(|e| e.ok()?.file_name().to_str()?.parse().ok())
                .collect();
            if !fds.is_empty() {
                return fds;
            }
        }
    }
    Vec::new()
}
