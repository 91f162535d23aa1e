use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{LogFormat, LoggingConfig};

/// Install a global subscriber for hosts that do not bring their own.
///
/// Embedded hosts normally install their own `tracing` subscriber and
/// never call this; it exists for examples, tests, and bare binaries.
/// Returns `false` when a global subscriber was already set.
pub fn init(config: &LoggingConfig) -> bool {
    let mut filter = EnvFilter::builder()
        .with_default_directive(tracing::metadata::LevelFilter::INFO.into())
        .with_env_var("CACHET_LOG")
        .from_env_lossy();
    if let Some(directives) = &config.filter {
        for directive in directives.split(',') {
            if let Ok(parsed) = directive.parse() {
                filter = filter.add_directive(parsed);
            }
        }
    }

    if !config.stderr {
        return Registry::default().with(filter).try_init().is_ok();
    }

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_target(true),
        ),
        LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(true),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_current_span(true),
        ),
    };

    Registry::default().with(layer).with(filter).try_init().is_ok()
}
