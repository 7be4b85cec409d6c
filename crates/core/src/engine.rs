//! The redirection engine: bind and connect interceptors over two rule tables.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use libc::{c_int, sockaddr, socklen_t};
use tracing::{debug, info, warn};

use crate::config::RuleSources;
use crate::endpoint::{endpoint_from_sockaddr, ipv4_from_sockaddr, Endpoint};
use crate::error::RedirectError;
use crate::rules::RuleTable;
use crate::socket::{self, BlockingGuard, Delegates, UnixAddr};
use crate::target::TargetDescriptor;

/// Process-wide redirection context.
///
/// Built once at attach time; the rule tables are read-only afterwards, so
/// interceptors can run concurrently on any thread. The only mutable state
/// is the list of paths bound so far, which [`Engine::teardown`] removes.
pub struct Engine {
    bind_rules: RuleTable,
    connect_rules: RuleTable,
    delegates: Delegates,
    bound: Mutex<Vec<PathBuf>>,
    torn_down: AtomicBool,
    owner: u32,
}

/// Outcome of [`Engine::teardown`].
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub removed: usize,
    pub failed: Vec<(PathBuf, io::Error)>,
}

impl Engine {
    pub fn new(sources: &RuleSources, delegates: Delegates) -> Self {
        Engine {
            bind_rules: RuleTable::from_source(sources.bind.as_deref()),
            connect_rules: RuleTable::from_source(sources.connect.as_deref()),
            delegates,
            bound: Mutex::new(Vec::new()),
            torn_down: AtomicBool::new(false),
            owner: std::process::id(),
        }
    }

    pub fn bind_rules(&self) -> &RuleTable {
        &self.bind_rules
    }

    pub fn connect_rules(&self) -> &RuleTable {
        &self.connect_rules
    }

    pub fn delegates(&self) -> &Delegates {
        &self.delegates
    }

    /// Intercepted `bind()`.
    ///
    /// IPv4 addresses with a matching rule are bound as a Unix socket at the
    /// rule's path instead; everything else is forwarded unchanged.
    ///
    /// # Safety
    /// `addr` must be null or point to `addrlen` readable bytes.
    pub unsafe fn bind(
        &self,
        fd: c_int,
        addr: *const sockaddr,
        addrlen: socklen_t,
    ) -> Result<(), RedirectError> {
        let Some(v4) = ipv4_from_sockaddr(addr, addrlen) else {
            return self.delegates.bind(fd, addr, addrlen);
        };
        let endpoint = Endpoint::from(v4);
        let Some(target) = self.bind_rules.lookup(&endpoint) else {
            return self.delegates.bind(fd, addr, addrlen);
        };

        debug!(fd, %endpoint, target, "redirecting bind");
        self.bind_unix(fd, target).inspect_err(|err| {
            warn!(fd, %endpoint, target, %err, "redirected bind failed");
        })
    }

    fn bind_unix(&self, fd: c_int, target: &str) -> Result<(), RedirectError> {
        let target = TargetDescriptor::parse(target)?;
        let addr = UnixAddr::new(&target.path)?;

        {
            let _blocking = BlockingGuard::capture(fd);
            socket::convert_to_unix(fd)?;
            self.bind_or_reclaim(fd, &addr)?;
        }
        self.record_bound(addr.path());

        if let Some(mode) = target.mode {
            socket::apply_mode(addr.path(), mode)?;
        }
        Ok(())
    }

    /// Bind `fd` to `addr`. If the path is taken, probe it: a live listener
    /// wins and the caller sees `EADDRINUSE`; a dead one is removed and the
    /// bind retried once.
    fn bind_or_reclaim(&self, fd: c_int, addr: &UnixAddr) -> Result<(), RedirectError> {
        match unsafe { self.delegates.bind(fd, addr.as_ptr(), addr.socklen()) } {
            Ok(()) => return Ok(()),
            Err(err) if err.errno() == libc::EADDRINUSE => {}
            Err(err) => return Err(err),
        }

        let ty = socket::socket_type(fd)?;
        if socket::probe_is_live(&self.delegates, addr, ty)? {
            return Err(RedirectError::AddrInUse(addr.path().to_path_buf()));
        }

        info!(path = %addr.path().display(), "reclaiming stale socket path");
        if let Err(err) = socket::unlink(addr.path()) {
            warn!(path = %addr.path().display(), %err, "failed to remove stale socket path");
        }
        unsafe { self.delegates.bind(fd, addr.as_ptr(), addr.socklen()) }
    }

    fn record_bound(&self, path: &Path) {
        if let Ok(mut bound) = self.bound.lock() {
            if !bound.iter().any(|p| p == path) {
                bound.push(path.to_path_buf());
            }
        }
    }

    /// Intercepted `connect()`.
    ///
    /// IPv4 and IPv6 destinations with a matching rule are connected to the
    /// rule's Unix socket path instead; everything else is forwarded with the
    /// caller's address untouched.
    ///
    /// # Safety
    /// `addr` must be null or point to `addrlen` readable bytes.
    pub unsafe fn connect(
        &self,
        fd: c_int,
        addr: *const sockaddr,
        addrlen: socklen_t,
    ) -> Result<(), RedirectError> {
        let endpoint = endpoint_from_sockaddr(addr, addrlen);
        let Some((endpoint, target)) =
            endpoint.and_then(|e| self.connect_rules.lookup(&e).map(|t| (e, t)))
        else {
            return self.delegates.connect(fd, addr, addrlen);
        };

        debug!(fd, %endpoint, target, "redirecting connect");
        self.connect_unix(fd, target).inspect_err(|err| {
            debug!(fd, %endpoint, target, %err, "redirected connect failed");
        })
    }

    fn connect_unix(&self, fd: c_int, target: &str) -> Result<(), RedirectError> {
        let target = TargetDescriptor::parse(target)?;
        if let Some(mode) = target.mode {
            debug!("ignoring mode {mode:03o} on connect rule");
        }
        let addr = UnixAddr::new(&target.path)?;

        {
            let _blocking = BlockingGuard::capture(fd);
            socket::convert_to_unix(fd)?;
        }
        unsafe { self.delegates.connect(fd, addr.as_ptr(), addr.socklen()) }
    }

    /// Paths successfully bound so far, in bind order.
    pub fn bound_paths(&self) -> Vec<PathBuf> {
        self.bound.lock().map(|b| b.clone()).unwrap_or_default()
    }

    /// Remove every socket path this engine bound. Runs once; later calls
    /// report nothing.
    ///
    /// Only the process that created the engine removes paths: a forked
    /// child inherits the list but not ownership of the listeners.
    ///
    /// Runs from the unload hook, after thread-local storage may already be
    /// gone, so it must not emit tracing events. Failures are returned for
    /// the caller to report.
    pub fn teardown(&self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if std::process::id() != self.owner || self.torn_down.swap(true, Ordering::AcqRel) {
            return report;
        }
        let bound = match self.bound.lock() {
            Ok(mut bound) => std::mem::take(&mut *bound),
            Err(_) => return report,
        };

        for path in bound {
            match socket::unlink(&path) {
                Ok(()) => report.removed += 1,
                Err(err) => report.failed.push((path, err)),
            }
        }
        report
    }
}
