//! Environment-supplied configuration.

use tracing::warn;

/// Listen-side rules.
pub const BIND_ENV: &str = "TTU_BIND";
/// Connect-side rules.
pub const CONNECT_ENV: &str = "TTU_CONNECT";
/// `tracing` filter directives for the preload library.
pub const LOG_ENV: &str = "TTU_LOG";

pub const DEFAULT_LOG_FILTER: &str = "warn";

/// The two raw rule strings the engine is built from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleSources {
    pub bind: Option<String>,
    pub connect: Option<String>,
}

impl RuleSources {
    pub fn new(bind: Option<&str>, connect: Option<&str>) -> Self {
        RuleSources {
            bind: bind.map(str::to_string),
            connect: connect.map(str::to_string),
        }
    }

    pub fn from_env() -> Self {
        RuleSources {
            bind: read_var(BIND_ENV),
            connect: read_var(CONNECT_ENV),
        }
    }
}

fn read_var(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(value) => Some(value),
        Err(std::env::VarError::NotPresent) => None,
        Err(std::env::VarError::NotUnicode(_)) => {
            warn!(name, "ignoring rule variable that is not valid UTF-8");
            None
        }
    }
}
