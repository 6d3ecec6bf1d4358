//! Tracing subscriber setup

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence when set
    #[serde(default = "default_level")]
    pub level: String,
    /// Include the event target (module path) in each line
    #[serde(default)]
    pub with_target: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            with_target: false,
        }
    }
}

impl LoggingConfig {
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Install a stderr fmt subscriber. Returns `false` if a global subscriber
/// was already set (the call is then a no-op).
pub fn init_tracing(config: &LoggingConfig) -> bool {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(config.with_target),
        )
        .with(config.filter())
        .try_init()
        .is_ok()
}
