pub mod agent_core;
pub mod config;
pub mod inference;
pub mod mcp_client;

pub use agent_core::{AgentError, ConversationEngine, EngineEvent, QueryResult};
pub use config::{find_config_path, load_config, AppConfig, ConfigError};

/// Default filter when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "opspilot=info,warn";

/// Initialize the tracing subscriber.
///
/// Logs go to stderr so stdout carries only answers. `RUST_LOG` overrides the
/// default filter; `json` switches to one JSON object per line. Calling this
/// twice is harmless: the second subscriber is discarded.
pub fn init_tracing(json: bool) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if installed.is_ok() {
        tracing::debug!(
            version = env!("CARGO_PKG_VERSION"),
            pid = std::process::id(),
            "tracing initialized"
        );
    }
}
