//! Redirection engine behind `libttu`: silently turns TCP `bind()` and
//! `connect()` calls into Unix-domain socket operations.
//!
//! Two rule tables, one per direction, map `host:port` patterns to
//! `[mode:]path` targets. The [`Engine`] consults them on every intercepted
//! call and either forwards the call untouched or swaps the caller's socket
//! for an `AF_UNIX` one under the same descriptor number before forwarding
//! with a rewritten address.
//!
//! The engine never resolves symbols itself: it forwards through the
//! [`Delegates`] it was built with. The preload crate supplies the real
//! libc functions; tests supply fakes.

pub mod config;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod parser;
pub mod rules;
pub mod socket;
pub mod target;

pub use config::RuleSources;
pub use endpoint::{Endpoint, EndpointKey};
pub use engine::{Engine, TeardownReport};
pub use error::RedirectError;
pub use rules::RuleTable;
pub use socket::{BindFn, ConnectFn, Delegates};
pub use target::TargetDescriptor;
