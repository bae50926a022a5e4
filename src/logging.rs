use crate::config::LoggingConfig;
use std::env;

/// Filter directive combining `RUST_LOG` with the configured SDK level
pub fn filter_directive(config: &LoggingConfig) -> String {
    let default_directive = format!("dsms_sdk={}", config.level.to_lowercase());
    let env_override = env::var("RUST_LOG").unwrap_or_default();
    if env_override.trim().is_empty() {
        default_directive
    } else if env_override.contains("dsms_sdk") {
        env_override
    } else {
        format!("{},{}", env_override, default_directive)
    }
}

/// Install a global fmt subscriber. Does nothing if one is already installed.
pub fn init_tracing(config: &LoggingConfig) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_directive(config))
        .with_target(true)
        .try_init();
}
