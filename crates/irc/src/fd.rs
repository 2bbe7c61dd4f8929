//! Socket descriptor handling for handoff across process images.

use tokio::net::TcpStream;

use warden_protocol::Result;

#[cfg(unix)]
mod imp {
    use std::{
        net::TcpStream as StdTcpStream,
        os::fd::{AsRawFd, FromRawFd, RawFd},
    };

    use {
        nix::{
            fcntl::{FcntlArg, FdFlag, fcntl},
            unistd::{close, dup},
        },
        tokio::net::TcpStream,
    };

    use warden_protocol::{Error, Result};

    /// Duplicate the socket's descriptor. The duplicate is inheritable
    /// across exec and owned by nothing in this process.
    pub fn duplicate(stream: &TcpStream) -> Result<i32> {
        dup(stream.as_raw_fd()).map_err(|e| Error::external("failed to dup socket descriptor", e))
    }

    /// Take ownership of an inherited socket descriptor.
    pub fn adopt(fd: i32) -> Result<TcpStream> {
        // Also proves `fd` is open before anything takes ownership of it.
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(|e| Error::external(format!("inherited descriptor {fd} is unusable"), e))?;
        let stream = from_inherited(fd);
        stream.set_nonblocking(true)?;
        Ok(TcpStream::from_std(stream)?)
    }

    /// Close an inherited descriptor that will not be adopted.
    pub fn release(fd: i32) -> Result<()> {
        close(fd).map_err(|e| Error::external(format!("failed to close descriptor {fd}"), e))
    }

    #[allow(unsafe_code)]
    fn from_inherited(fd: RawFd) -> StdTcpStream {
        // SAFETY: `fd` was passed to this image by the previous one, which
        // duplicated it from a connected TCP socket and never closed the
        // duplicate. The fcntl above confirmed it is open, and this is the
        // only place that takes ownership of it.
        unsafe { StdTcpStream::from_raw_fd(fd) }
    }
}

#[cfg(not(unix))]
mod imp {
    use tokio::net::TcpStream;

    use warden_protocol::{Error, Result};

    pub fn duplicate(_stream: &TcpStream) -> Result<i32> {
        Err(Error::Unsupported {
            operation: "socket handoff",
        })
    }

    pub fn adopt(_fd: i32) -> Result<TcpStream> {
        Err(Error::Unsupported {
            operation: "socket handoff",
        })
    }

    pub fn release(_fd: i32) -> Result<()> {
        Err(Error::Unsupported {
            operation: "socket handoff",
        })
    }
}

pub(crate) fn duplicate(stream: &TcpStream) -> Result<i32> {
    imp::duplicate(stream)
}

pub(crate) fn adopt(fd: i32) -> Result<TcpStream> {
    imp::adopt(fd)
}

pub(crate) fn release(fd: i32) -> Result<()> {
    imp::release(fd)
}
