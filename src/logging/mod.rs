//! Structured logging with a runtime-adjustable threshold
//!
//! `init_logging` installs the global subscriber once per process. The
//! `EnvFilter` (from `RUST_LOG`) caps noisy dependencies; the fmt layer is
//! filtered by a `LogLevelState` that the logging ConfigMap can change at
//! any time.

mod level;

pub use level::{
    parse_level, LogLevelController, LogLevelState, LOGLEVEL_KEY_PREFIX, ZAP_LOGGER_CONFIG_KEY,
};

use tracing::{info_span, Span};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer};

/// Directives used when `RUST_LOG` is not set
const DEFAULT_DIRECTIVES: &str = "trace,hyper=info,hyper_util=info,h2=info,tower=info,rustls=info";

/// Install the global subscriber
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(level: &LogLevelState) -> Result<(), TryInitError> {
    let threshold = level.clone();
    let fmt = tracing_subscriber::fmt::layer()
        .with_filter(filter_fn(move |meta| threshold.allows(meta.level())));

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES)),
        )
        .with(fmt)
        .try_init()
}

/// Span carrying the component and pod identity for the whole run
pub fn adapter_span(component: &str, pod: &str) -> Span {
    info_span!("adapter", component = component, pod = pod)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "level_test.rs"]
mod level_tests;
