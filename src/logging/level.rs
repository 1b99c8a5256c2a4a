//! Runtime-adjustable log severity
//!
//! `LogLevelState` is the single shared threshold read by the fmt layer on
//! every event. `LogLevelController` updates it from the logging ConfigMap.

use crate::config::{ConfigObserver, ConfigRecord};
use crate::error::AdapterError;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info, Level};

/// Key holding the zap-style JSON logger document
pub const ZAP_LOGGER_CONFIG_KEY: &str = "zap-logger-config";

/// Prefix of per-component level keys (`loglevel.<component>`)
pub const LOGLEVEL_KEY_PREFIX: &str = "loglevel.";

/// Current minimum severity, shared between the subscriber and the controller
#[derive(Debug, Clone)]
pub struct LogLevelState {
    level: Arc<AtomicU8>,
}

impl LogLevelState {
    pub fn new(level: Level) -> Self {
        Self {
            level: Arc::new(AtomicU8::new(rank(&level))),
        }
    }

    pub fn get(&self) -> Level {
        from_rank(self.level.load(Ordering::SeqCst))
    }

    /// Replace the threshold, returning the previous one
    pub fn set(&self, level: Level) -> Level {
        from_rank(self.level.swap(rank(&level), Ordering::SeqCst))
    }

    /// Whether an event at `level` passes the current threshold
    pub fn allows(&self, level: &Level) -> bool {
        rank(level) <= self.level.load(Ordering::SeqCst)
    }
}

impl Default for LogLevelState {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

fn rank(level: &Level) -> u8 {
    match *level {
        Level::ERROR => 1,
        Level::WARN => 2,
        Level::INFO => 3,
        Level::DEBUG => 4,
        Level::TRACE => 5,
    }
}

fn from_rank(rank: u8) -> Level {
    match rank {
        0 | 1 => Level::ERROR,
        2 => Level::WARN,
        3 => Level::INFO,
        4 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Parse a severity name
///
/// Accepts the zap names as well (`dpanic`, `panic` and `fatal` map to error).
pub fn parse_level(raw: &str) -> Option<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" | "dpanic" | "panic" | "fatal" => Some(Level::ERROR),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct ZapLoggerConfig {
    level: Option<String>,
}

/// Applies the logging ConfigMap to a `LogLevelState`
pub struct LogLevelController {
    component: String,
    state: LogLevelState,
}

impl LogLevelController {
    pub fn new(component: &str, state: LogLevelState) -> Self {
        LogLevelController {
            component: component.to_string(),
            state,
        }
    }

    /// Level requested by `record`, if it names one
    ///
    /// `loglevel.<component>` wins over the `level` field of the zap document.
    fn requested_level(&self, record: &ConfigRecord) -> Result<Option<String>, AdapterError> {
        let component_key = format!("{}{}", LOGLEVEL_KEY_PREFIX, self.component);
        if let Some(raw) = record.get(&component_key).filter(|v| !v.is_empty()) {
            return Ok(Some(raw.to_string()));
        }

        let Some(doc) = record.get(ZAP_LOGGER_CONFIG_KEY).filter(|v| !v.is_empty()) else {
            return Ok(None);
        };
        let parsed: ZapLoggerConfig = serde_json::from_str(doc).map_err(|e| {
            AdapterError::invalid_format(
                &record.name,
                format!("{} is not valid JSON: {}", ZAP_LOGGER_CONFIG_KEY, e),
            )
        })?;
        Ok(parsed.level.filter(|l| !l.trim().is_empty()))
    }
}

#[async_trait]
impl ConfigObserver for LogLevelController {
    fn name(&self) -> &str {
        "log-level"
    }

    async fn apply(&self, record: &ConfigRecord) -> Result<(), AdapterError> {
        let Some(raw) = self.requested_level(record)? else {
            debug!(
                record = %record.name,
                component = %self.component,
                "No log level configured, keeping current level"
            );
            return Ok(());
        };

        let level = parse_level(&raw).ok_or_else(|| {
            AdapterError::invalid_format(&record.name, format!("unknown log level {:?}", raw))
        })?;

        let previous = self.state.set(level);
        if previous != level {
            info!(
                component = %self.component,
                from = %previous,
                to = %level,
                "Log level updated"
            );
        }
        Ok(())
    }
}
