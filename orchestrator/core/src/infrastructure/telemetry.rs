// Copyright (c) 2026 DocForge Contributors
// SPDX-License-Identifier: AGPL-3.0

use anyhow::{Context, Result};

use crate::domain::config::LoggingConfig;

/// Initialize tracing subscriber for logging.
///
/// `RUST_LOG` wins over the configured level. Fails if a global subscriber
/// is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let installed = match config.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.compact().try_init(),
    };

    installed
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to install tracing subscriber")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_fails() {
        let config = LoggingConfig::default();
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }
}
