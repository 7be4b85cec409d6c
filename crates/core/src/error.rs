//! Errors surfaced by the redirection engine.
//!
//! Every variant maps onto the `errno` value the intercepted call reports to
//! its caller via [`RedirectError::errno`].

use std::io;
use std::path::PathBuf;

use libc::c_int;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RedirectError {
    #[error("invalid mode in target '{0}'")]
    InvalidMode(String),

    #[error("unknown parameters at segment {index} of target '{target}'")]
    ExtraSegment { target: String, index: usize },

    #[error("empty socket path in target '{0}'")]
    EmptyPath(String),

    #[error("socket path too long ({len} bytes, limit {max}): {path}")]
    PathTooLong { path: String, len: usize, max: usize },

    #[error("live listener already accepting at {}", .0.display())]
    AddrInUse(PathBuf),

    #[error("failed to set mode {mode:03o} on {}: {source}", .path.display())]
    Chmod {
        path: PathBuf,
        mode: u32,
        #[source]
        source: io::Error,
    },

    #[error("setting socket mode is not supported on this platform")]
    ModeUnsupported,

    #[error("failed to convert fd {fd} to a unix socket: {source}")]
    Convert {
        fd: c_int,
        #[source]
        source: io::Error,
    },

    #[error("failed to open reclaim probe socket: {0}")]
    Probe(#[source] io::Error),

    #[error(transparent)]
    Os(#[from] io::Error),
}

impl RedirectError {
    /// The `errno` value reported to the caller of the intercepted call.
    pub fn errno(&self) -> c_int {
        match self {
            RedirectError::InvalidMode(_)
            | RedirectError::ExtraSegment { .. }
            | RedirectError::EmptyPath(_)
            | RedirectError::PathTooLong { .. } => libc::EADDRNOTAVAIL,
            RedirectError::AddrInUse(_) => libc::EADDRINUSE,
            RedirectError::Chmod { .. } | RedirectError::ModeUnsupported => libc::EACCES,
            RedirectError::Convert { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            RedirectError::Probe(source) | RedirectError::Os(source) => {
                source.raw_os_error().unwrap_or(libc::EIO)
            }
        }
    }

    /// Capture `errno` left behind by a failed libc call.
    pub(crate) fn last_os_error() -> Self {
        RedirectError::Os(io::Error::last_os_error())
    }
}
