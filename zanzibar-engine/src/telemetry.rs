use crate::{
    config::LoggingConfig,
    error::{Result, ZanzibarError},
};
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Filter applied when neither `RUST_LOG` nor the configured level parses
const FALLBACK_FILTER: &str = "info";

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` wins over `config.level`. Fails if a subscriber is already set.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new(FALLBACK_FILTER));

    let installed = if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .json(),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_level(true),
            )
            .try_init()
    };

    installed.map_err(|e| {
        ZanzibarError::Configuration(format!("Failed to initialize tracing: {}", e))
    })
}
