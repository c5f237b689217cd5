//! ---
//! courier_section: "01-core-functionality"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Shared primitives and utilities for courier components."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "COURIER_LOG";

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Available log formats.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    Pretty,
    StructuredJson,
}

/// Filter directive used when neither `COURIER_LOG` nor `RUST_LOG` is set.
pub fn default_directive(config: &LoggingConfig) -> &'static str {
    if config.debug {
        "debug"
    } else {
        "info"
    }
}

/// Initialize the tracing subscriber from the injected logging configuration.
///
/// * `COURIER_LOG` overrides the filter (e.g. `info`, `courier_core=trace`),
///   then `RUST_LOG` is honoured, finally the debug toggle picks `debug` or
///   `info`.
/// * A rolling daily JSON file is added when `config.directory` is set.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    let fallback = default_directive(config);
    let filter = match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(directive).unwrap_or_else(|err| {
            eprintln!("invalid {LOG_ENV} directive ({err}); defaulting to {fallback}");
            EnvFilter::new(fallback)
        }),
        Err(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
    };

    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .json()
            .with_writer(std::io::stdout)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_writer(std::io::stdout)
            .boxed(),
    };

    let file_layer = match &config.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory)?;
            let prefix = config
                .file_prefix
                .clone()
                .unwrap_or_else(|| service_name.to_owned());
            let appender = daily(directory, format!("{prefix}.log"));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            Some(
                fmt::layer()
                    .with_target(true)
                    .json()
                    .with_writer(writer)
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .ok();

    info!(service = %service_name, format = ?config.format, debug = config.debug, "tracing initialised");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_toggle_selects_default_directive() {
        let mut config = LoggingConfig::default();
        assert_eq!(default_directive(&config), "info");
        config.debug = true;
        assert_eq!(default_directive(&config), "debug");
    }

    #[test]
    fn init_is_repeatable() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = LoggingConfig {
            directory: Some(dir.path().to_path_buf()),
            ..LoggingConfig::default()
        };
        init_tracing("courier-test", &config).expect("first init");
        init_tracing("courier-test", &config).expect("second init");
    }
}
