//! Low-level socket plumbing: the delegation interface to the real
//! `bind`/`connect`, in-place domain conversion, blocking-mode capture and
//! the stale-listener probe.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use libc::{c_int, sockaddr, sockaddr_un, socklen_t, AF_UNIX};
use tracing::debug;

use crate::error::RedirectError;

pub type BindFn = unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;
pub type ConnectFn = unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;

/// The underlying operations the engine forwards to.
///
/// In the preload library these are the next `bind`/`connect` symbols after
/// ours; in tests they are the libc functions or recording fakes.
#[derive(Clone, Copy)]
pub struct Delegates {
    pub bind: BindFn,
    pub connect: ConnectFn,
}

impl Delegates {
    /// Delegates calling libc directly.
    pub fn libc() -> Self {
        Delegates {
            bind: libc::bind,
            connect: libc::connect,
        }
    }

    /// # Safety
    /// `addr` must point to `addrlen` readable bytes (or be whatever the
    /// caller of the intercepted function passed).
    pub unsafe fn bind(
        &self,
        fd: c_int,
        addr: *const sockaddr,
        addrlen: socklen_t,
    ) -> Result<(), RedirectError> {
        if (self.bind)(fd, addr, addrlen) == 0 {
            Ok(())
        } else {
            Err(RedirectError::last_os_error())
        }
    }

    /// # Safety
    /// Same contract as [`Delegates::bind`].
    pub unsafe fn connect(
        &self,
        fd: c_int,
        addr: *const sockaddr,
        addrlen: socklen_t,
    ) -> Result<(), RedirectError> {
        if (self.connect)(fd, addr, addrlen) == 0 {
            Ok(())
        } else {
            Err(RedirectError::last_os_error())
        }
    }
}

// ---------------------------------------------------------------------------
// Filesystem-domain addresses
// ---------------------------------------------------------------------------

/// A filled-in `sockaddr_un` for a filesystem path.
pub struct UnixAddr {
    addr: sockaddr_un,
    path: PathBuf,
}

impl UnixAddr {
    /// Largest path (excluding the NUL terminator) that fits `sun_path`.
    pub fn max_path_len() -> usize {
        let addr: sockaddr_un = unsafe { std::mem::zeroed() };
        addr.sun_path.len() - 1
    }

    /// Build the address, rejecting paths that would not fit rather than
    /// truncating them.
    pub fn new(path: &str) -> Result<Self, RedirectError> {
        let bytes = path.as_bytes();
        let max = Self::max_path_len();
        if bytes.len() > max {
            return Err(RedirectError::PathTooLong {
                path: path.to_string(),
                len: bytes.len(),
                max,
            });
        }
        if bytes.is_empty() {
            return Err(RedirectError::EmptyPath(path.to_string()));
        }

        let mut addr: sockaddr_un = unsafe { std::mem::zeroed() };
        addr.sun_family = AF_UNIX as libc::sa_family_t;
        for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }
        Ok(UnixAddr {
            addr,
            path: PathBuf::from(path),
        })
    }

    pub fn as_ptr(&self) -> *const sockaddr {
        &self.addr as *const sockaddr_un as *const sockaddr
    }

    pub fn socklen(&self) -> socklen_t {
        std::mem::size_of::<sockaddr_un>() as socklen_t
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ---------------------------------------------------------------------------
// Descriptor flags
// ---------------------------------------------------------------------------

/// `SO_TYPE` of `fd`.
pub(crate) fn socket_type(fd: c_int) -> io::Result<c_int> {
    let mut ty: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            &mut ty as *mut c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if ret == 0 {
        Ok(ty)
    } else {
        Err(io::Error::last_os_error())
    }
}

fn set_nonblocking(fd: c_int, nonblocking: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let wanted = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if wanted != flags && unsafe { libc::fcntl(fd, libc::F_SETFL, wanted) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Captures a descriptor's blocking mode and restores it when dropped.
///
/// Domain conversion swaps the open file description behind `fd`, so the
/// `O_NONBLOCK` status flag the caller set would otherwise be lost.
pub struct BlockingGuard {
    fd: c_int,
    nonblocking: Option<bool>,
}

impl BlockingGuard {
    pub fn capture(fd: c_int) -> Self {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        let nonblocking = (flags >= 0).then_some(flags & libc::O_NONBLOCK != 0);
        BlockingGuard { fd, nonblocking }
    }
}

impl Drop for BlockingGuard {
    fn drop(&mut self) {
        if let Some(nonblocking) = self.nonblocking {
            if let Err(err) = set_nonblocking(self.fd, nonblocking) {
                debug!(fd = self.fd, %err, "failed to restore blocking mode");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Domain conversion
// ---------------------------------------------------------------------------

/// Replace the socket behind `fd` with a fresh `AF_UNIX` socket of the same
/// type, keeping the descriptor number and its close-on-exec flag.
pub fn convert_to_unix(fd: c_int) -> Result<(), RedirectError> {
    let convert = |source| RedirectError::Convert { fd, source };

    let ty = socket_type(fd).map_err(convert)?;
    let fd_flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if fd_flags < 0 {
        return Err(convert(io::Error::last_os_error()));
    }

    let fresh = unsafe { libc::socket(AF_UNIX, ty, 0) };
    if fresh < 0 {
        return Err(convert(io::Error::last_os_error()));
    }

    let dup = unsafe { libc::dup2(fresh, fd) };
    let dup_err = io::Error::last_os_error();
    unsafe { libc::close(fresh) };
    if dup < 0 {
        return Err(convert(dup_err));
    }

    if fd_flags & libc::FD_CLOEXEC != 0
        && unsafe { libc::fcntl(fd, libc::F_SETFD, fd_flags) } < 0
    {
        return Err(convert(io::Error::last_os_error()));
    }

    debug!(fd, ty, "converted descriptor to AF_UNIX");
    Ok(())
}

// ---------------------------------------------------------------------------
// Stale-listener probe
// ---------------------------------------------------------------------------

/// Check whether something is actively accepting on `addr`.
///
/// A non-blocking probe of socket type `ty` connects to the path; success,
/// an in-progress connection, or a full backlog (`EAGAIN`) all mean a live
/// listener. Any other failure means the path is stale.
pub fn probe_is_live(
    delegates: &Delegates,
    addr: &UnixAddr,
    ty: c_int,
) -> Result<bool, RedirectError> {
    let probe = unsafe { libc::socket(AF_UNIX, ty, 0) };
    if probe < 0 {
        return Err(RedirectError::Probe(io::Error::last_os_error()));
    }
    let probe = unsafe { OwnedFd::from_raw_fd(probe) };
    set_nonblocking(probe.as_raw_fd(), true).map_err(RedirectError::Probe)?;

    match unsafe { delegates.connect(probe.as_raw_fd(), addr.as_ptr(), addr.socklen()) } {
        Ok(()) => Ok(true),
        Err(err) => {
            let errno = err.errno();
            debug!(path = %addr.path().display(), errno, "reclaim probe failed to connect");
            Ok(matches!(errno, libc::EINPROGRESS | libc::EALREADY | libc::EAGAIN))
        }
    }
}

/// Remove a socket path. A path that is already gone is not an error.
pub fn unlink(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Apply permission bits to a bound socket path.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn apply_mode(path: &Path, mode: u32) -> Result<(), RedirectError> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|source| {
        RedirectError::Chmod {
            path: path.to_path_buf(),
            mode,
            source,
        }
    })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn apply_mode(_path: &Path, _mode: u32) -> Result<(), RedirectError> {
    Err(RedirectError::ModeUnsupported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::{UnixDatagram, UnixListener};

    fn tcp_socket() -> c_int {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        fd
    }

    fn family_of(fd: c_int) -> c_int {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of_val(&storage) as socklen_t;
        let ret = unsafe {
            libc::getsockname(fd, &mut storage as *mut _ as *mut sockaddr, &mut len)
        };
        assert_eq!(ret, 0);
        storage.ss_family as c_int
    }

    #[test]
    fn unix_addr_rejects_long_paths() {
        let max = UnixAddr::max_path_len();
        let fits = "a".repeat(max);
        assert!(UnixAddr::new(&fits).is_ok());

        let too_long = "a".repeat(max + 1);
        let err = UnixAddr::new(&too_long).err().unwrap();
        assert!(matches!(err, RedirectError::PathTooLong { .. }));
        assert_eq!(err.errno(), libc::EADDRNOTAVAIL);
    }

    #[test]
    fn conversion_keeps_descriptor_and_type() {
        let fd = tcp_socket();
        assert_eq!(family_of(fd), libc::AF_INET);
        convert_to_unix(fd).unwrap();
        assert_eq!(family_of(fd), AF_UNIX);
        assert_eq!(socket_type(fd).unwrap(), libc::SOCK_STREAM);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn conversion_keeps_cloexec() {
        let fd = tcp_socket();
        unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
        convert_to_unix(fd).unwrap();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn conversion_of_invalid_fd_reports_error() {
        let err = convert_to_unix(-1).unwrap_err();
        assert_eq!(err.errno(), libc::EBADF);
    }

    #[test]
    fn blocking_guard_restores_mode() {
        let fd = tcp_socket();
        set_nonblocking(fd, true).unwrap();
        {
            let _guard = BlockingGuard::capture(fd);
            convert_to_unix(fd).unwrap();
        }
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn probe_distinguishes_live_from_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.sock");
        let addr = UnixAddr::new(path.to_str().unwrap()).unwrap();
        let delegates = Delegates::libc();

        let listener = UnixListener::bind(&path).unwrap();
        assert!(probe_is_live(&delegates, &addr, libc::SOCK_STREAM).unwrap());

        drop(listener);
        assert!(path.exists());
        assert!(!probe_is_live(&delegates, &addr, libc::SOCK_STREAM).unwrap());
    }

    #[test]
    fn probe_uses_datagram_sockets_for_datagram_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dgram.sock");
        let addr = UnixAddr::new(path.to_str().unwrap()).unwrap();
        let _socket = UnixDatagram::bind(&path).unwrap();
        assert!(probe_is_live(&Delegates::libc(), &addr, libc::SOCK_DGRAM).unwrap());
    }

    #[test]
    fn unlink_tolerates_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        assert!(unlink(&dir.path().join("missing.sock")).is_ok());
    }

    #[test]
    fn unlink_removes_socket_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.sock");
        drop(UnixListener::bind(&path).unwrap());
        unlink(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn liveness_check_closes_its_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("count.sock");
        let addr = UnixAddr::new(path.to_str().unwrap()).unwrap();
        drop(UnixListener::bind(&path).unwrap());

        let before = std::fs::read_dir("/dev/fd").map(|d| d.count()).ok();
        for _ in 0..64 {
            assert!(!probe_is_live(&Delegates::libc(), &addr, libc::SOCK_STREAM).unwrap());
        }
        let after = std::fs::read_dir("/dev/fd").map(|d| d.count()).ok();
        if let (Some(before), Some(after)) = (before, after) {
            assert!(after < before + 32, "sockets leaked: {before} -> {after}");
        }
    }
}
