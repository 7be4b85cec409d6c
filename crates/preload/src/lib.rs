//! LD_PRELOAD / DYLD_INSERT_LIBRARIES library that silently converts TCP
//! sockets to Unix sockets.
//!
//! Intercepts `bind` and `connect`. Rules come from two environment
//! variables read once when the library is loaded:
//!
//! - `TTU_BIND`: listen-side rules, e.g. `127.0.0.1:8080=660:/run/app.sock`
//! - `TTU_CONNECT`: connect-side rules, e.g. `*:5432=/run/postgres.sock`
//!
//! A matching call has its descriptor replaced in place by an `AF_UNIX`
//! socket and proceeds against the rule's path; everything else reaches libc
//! untouched. Socket paths bound by this process are removed when the
//! library is unloaded. Diagnostics go to stderr, filtered by `TTU_LOG`.
//!
//! ## Platform differences
//!
//! **Linux:** The dynamic linker resolves symbols in LD_PRELOAD libraries first,
//! so defining `bind()`/`connect()` directly interposes them.  We forward to
//! the real libc functions via `dlsym(RTLD_NEXT, ...)`.
//!
//! **macOS:** Two-level namespaces prevent simple symbol overriding.  Instead we
//! define `ttu_bind()`/`ttu_connect()` and register a `__DATA,__interpose`
//! table.  dyld does not apply an interpose table to the image that declares
//! it, so our own calls to `libc::bind`/`libc::connect` reach libSystem.

use std::sync::OnceLock;

use libc::{c_int, sockaddr, socklen_t};
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use ttu_core::config::{DEFAULT_LOG_FILTER, LOG_ENV};
use ttu_core::{Delegates, Engine, RedirectError, RuleSources};

#[cfg(not(target_os = "macos"))]
use libc::{c_char, RTLD_NEXT};
#[cfg(not(target_os = "macos"))]
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
#[cfg(not(target_os = "macos"))]
use ttu_core::{BindFn, ConnectFn};

// ---------------------------------------------------------------------------
// Process-wide engine
// ---------------------------------------------------------------------------
//
// Built exactly once by the load-time constructor and torn down by the
// unload-time destructor.  Interceptors that run before the constructor
// (other constructors calling bind/connect) see no engine and forward.

static ENGINE: OnceLock<Engine> = OnceLock::new();

#[derive(Debug, Error)]
enum InitError {
    #[error("unable to resolve the real `{0}`")]
    MissingSymbol(&'static str),
    #[error("engine already initialized")]
    AlreadyInitialized,
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn attach() -> Result<(), InitError> {
    init_logging();

    let engine = Engine::new(&RuleSources::from_env(), real_delegates()?);
    info!(
        bind_rules = engine.bind_rules().len(),
        connect_rules = engine.connect_rules().len(),
        "libttu loaded"
    );
    ENGINE
        .set(engine)
        .map_err(|_| InitError::AlreadyInitialized)
}

// The unload hook runs after thread-local storage has been destroyed, so
// the tracing subscriber is off limits here.  Teardown failures are written
// straight to stderr instead.

fn write_stderr(buf: &[u8]) {
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
        );
    }
}

fn detach() {
    let Some(engine) = ENGINE.get() else {
        return;
    };
    let report = engine.teardown();
    if LevelFilter::current() < LevelFilter::WARN {
        return;
    }
    for (path, err) in &report.failed {
        let line = format!(
            "[W:libttu] failed to remove socket path {}: {}\n",
            path.display(),
            err
        );
        write_stderr(line.as_bytes());
    }
}

extern "C" fn ttu_attach() {
    if let Err(err) = attach() {
        error!(%err, "cannot initialize libttu");
        std::process::abort();
    }
}

extern "C" fn ttu_detach() {
    if std::panic::catch_unwind(detach).is_err() {
        write_stderr(b"[E:libttu] panic during unload\n");
    }
}

#[cfg(not(target_os = "macos"))]
#[used]
#[link_section = ".init_array"]
static INIT_FN: extern "C" fn() = ttu_attach;

#[cfg(not(target_os = "macos"))]
#[used]
#[link_section = ".fini_array"]
static FINI_FN: extern "C" fn() = ttu_detach;

/// macOS library constructor/destructor: registered via
/// `__DATA,__mod_init_func` / `__DATA,__mod_term_func`.
#[cfg(target_os = "macos")]
#[used]
#[link_section = "__DATA,__mod_init_func"]
static INIT_FN: extern "C" fn() = ttu_attach;

#[cfg(target_os = "macos")]
#[used]
#[link_section = "__DATA,__mod_term_func"]
static FINI_FN: extern "C" fn() = ttu_detach;

// ---------------------------------------------------------------------------
// Real libc function pointers: Linux only (resolved via dlsym)
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "macos"))]
macro_rules! resolve {
    ($name:ident, $ty:ty) => {{
        static ADDR: AtomicUsize = AtomicUsize::new(0);
        static RESOLVED: AtomicBool = AtomicBool::new(false);
        if !RESOLVED.load(Ordering::Acquire) {
            let sym = unsafe {
                libc::dlsym(
                    RTLD_NEXT,
                    concat!(stringify!($name), "\0").as_ptr() as *const c_char,
                )
            };
            if !sym.is_null() {
                ADDR.store(sym as usize, Ordering::Release);
            }
            RESOLVED.store(true, Ordering::Release);
        }
        let addr = ADDR.load(Ordering::Acquire);
        if addr != 0 {
            Some(unsafe { std::mem::transmute::<usize, $ty>(addr) })
        } else {
            None
        }
    }};
}

#[cfg(not(target_os = "macos"))]
fn real_bind() -> Option<BindFn> {
    resolve!(bind, BindFn)
}

#[cfg(not(target_os = "macos"))]
fn real_connect() -> Option<ConnectFn> {
    resolve!(connect, ConnectFn)
}

#[cfg(not(target_os = "macos"))]
fn real_delegates() -> Result<Delegates, InitError> {
    Ok(Delegates {
        bind: real_bind().ok_or(InitError::MissingSymbol("bind"))?,
        connect: real_connect().ok_or(InitError::MissingSymbol("connect"))?,
    })
}

#[cfg(target_os = "macos")]
fn real_delegates() -> Result<Delegates, InitError> {
    Ok(Delegates::libc())
}

// ---------------------------------------------------------------------------
// Portable errno helper
// ---------------------------------------------------------------------------

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn set_errno(val: c_int) {
    *libc::__errno_location() = val;
}

#[cfg(target_os = "macos")]
unsafe fn set_errno(val: c_int) {
    *libc::__error() = val;
}

/// Convert an engine result to the C convention: `0`, or `-1` with `errno`.
unsafe fn to_c(result: Result<(), RedirectError>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(err) => {
            set_errno(err.errno());
            -1
        }
    }
}

// ---------------------------------------------------------------------------
// Per-thread reentrancy guard
// ---------------------------------------------------------------------------
//
// A bind/connect issued while an interceptor is already running on this
// thread (for instance by a logging sink) goes straight to libc.

thread_local! {
    static IN_HOOK: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

struct ReentrancyGuard;

impl ReentrancyGuard {
    fn enter() -> Option<Self> {
        IN_HOOK.with(|flag| {
            if flag.get() {
                None
            } else {
                flag.set(true);
                Some(ReentrancyGuard)
            }
        })
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        IN_HOOK.with(|flag| flag.set(false));
    }
}

unsafe fn intercept_bind(
    engine: &Engine,
    fd: c_int,
    addr: *const sockaddr,
    addrlen: socklen_t,
) -> c_int {
    match ReentrancyGuard::enter() {
        Some(_guard) => to_c(engine.bind(fd, addr, addrlen)),
        None => (engine.delegates().bind)(fd, addr, addrlen),
    }
}

unsafe fn intercept_connect(
    engine: &Engine,
    fd: c_int,
    addr: *const sockaddr,
    addrlen: socklen_t,
) -> c_int {
    match ReentrancyGuard::enter() {
        Some(_guard) => to_c(engine.connect(fd, addr, addrlen)),
        None => (engine.delegates().connect)(fd, addr, addrlen),
    }
}

// ===========================================================================
// Intercepted libc functions: Linux (LD_PRELOAD + dlsym)
// ===========================================================================

#[cfg(not(target_os = "macos"))]
mod linux_intercept {
    use super::*;

    /// Intercept `bind()`.
    #[no_mangle]
    pub unsafe extern "C" fn bind(fd: c_int, addr: *const sockaddr, addrlen: socklen_t) -> c_int {
        if let Some(engine) = ENGINE.get() {
            return intercept_bind(engine, fd, addr, addrlen);
        }
        match real_bind() {
            Some(real) => real(fd, addr, addrlen),
            None => {
                set_errno(libc::ENOSYS);
                -1
            }
        }
    }

    /// Intercept `connect()`.
    #[no_mangle]
    pub unsafe extern "C" fn connect(
        fd: c_int,
        addr: *const sockaddr,
        addrlen: socklen_t,
    ) -> c_int {
        if let Some(engine) = ENGINE.get() {
            return intercept_connect(engine, fd, addr, addrlen);
        }
        match real_connect() {
            Some(real) => real(fd, addr, addrlen),
            None => {
                set_errno(libc::ENOSYS);
                -1
            }
        }
    }
}

// ===========================================================================
// Intercepted libc functions: macOS (DYLD_INSERT_LIBRARIES + __interpose)
// ===========================================================================

#[cfg(target_os = "macos")]
mod macos_intercept {
    use super::*;

    /// Intercept `bind()`.
    #[no_mangle]
    pub unsafe extern "C" fn ttu_bind(
        fd: c_int,
        addr: *const sockaddr,
        addrlen: socklen_t,
    ) -> c_int {
        match ENGINE.get() {
            Some(engine) => intercept_bind(engine, fd, addr, addrlen),
            None => libc::bind(fd, addr, addrlen),
        }
    }

    /// Intercept `connect()`.
    #[no_mangle]
    pub unsafe extern "C" fn ttu_connect(
        fd: c_int,
        addr: *const sockaddr,
        addrlen: socklen_t,
    ) -> c_int {
        match ENGINE.get() {
            Some(engine) => intercept_connect(engine, fd, addr, addrlen),
            None => libc::connect(fd, addr, addrlen),
        }
    }
}

// ===========================================================================
// macOS dyld interpose table
// ===========================================================================

#[cfg(target_os = "macos")]
mod interpose {
    use super::macos_intercept::*;

    #[repr(C)]
    struct InterposeEntry {
        replacement: *const (),
        original: *const (),
    }

    // SAFETY: These are immutable function pointers resolved at load time.
    unsafe impl Sync for InterposeEntry {}

    #[link_section = "__DATA,__interpose"]
    #[used]
    static INTERPOSE_TABLE: [InterposeEntry; 2] = [
        InterposeEntry {
            replacement: ttu_bind as *const (),
            original: libc::bind as *const (),
        },
        InterposeEntry {
            replacement: ttu_connect as *const (),
            original: libc::connect as *const (),
        },
    ];
}
