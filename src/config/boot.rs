//! Boot-time configuration read from the environment
//!
//! Values are read once through a lookup closure so tests can supply
//! their own environment without touching process-global state.

use crate::error::AdapterError;
use std::time::Duration;

/// Default port for the diagnostics listener
pub const DEFAULT_DIAGNOSTICS_PORT: u16 = 8008;

/// Default name of the logging ConfigMap
pub const DEFAULT_LOGGING_CONFIG_MAP: &str = "config-logging";

/// Default name of the observability ConfigMap
pub const DEFAULT_OBSERVABILITY_CONFIG_MAP: &str = "config-observability";

/// How long to wait for the API server to report a sufficient version
pub const DEFAULT_VERSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between version discovery attempts
pub const DEFAULT_VERSION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Time allowed for supervised tasks to stop after shutdown is raised
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

const ENV_NAMESPACE: &str = "SYSTEM_NAMESPACE";
const ENV_POD_NAME: &str = "SYSTEM_POD_NAME";
const ENV_HOSTNAME: &str = "HOSTNAME";
const ENV_PROFILE_PORT: &str = "SYSTEM_PROFILE_PORT";
const ENV_LOGGING_CONFIG_MAP: &str = "SYSTEM_LOGGING_CONFIG_MAP_NAME";
const ENV_OBSERVABILITY_CONFIG_MAP: &str = "SYSTEM_OBSERVABILITY_CONFIG_MAP_NAME";
const ENV_MIN_VERSION: &str = "SYSTEM_KUBERNETES_MIN_VERSION";
const ENV_SHUTDOWN_GRACE: &str = "SYSTEM_SHUTDOWN_GRACE_SECONDS";

/// Immutable snapshot of the process configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfig {
    pub pod_name: String,
    pub namespace: String,
    pub diagnostics_port: u16,
    pub logging_config_map: String,
    pub observability_config_map: String,
    pub kubernetes_min_version: String,
    pub version_timeout: Duration,
    pub version_poll_interval: Duration,
    pub shutdown_grace: Duration,
}

impl BootConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self, AdapterError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`
    ///
    /// Empty values are treated as absent.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AdapterError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let namespace = get(ENV_NAMESPACE).ok_or_else(|| missing(ENV_NAMESPACE))?;
        let kubernetes_min_version =
            get(ENV_MIN_VERSION).ok_or_else(|| missing(ENV_MIN_VERSION))?;

        let pod_name = get(ENV_POD_NAME)
            .or_else(|| get(ENV_HOSTNAME))
            .ok_or_else(|| {
                AdapterError::InvalidConfiguration(format!(
                    "{} (or {}) must be set",
                    ENV_POD_NAME, ENV_HOSTNAME
                ))
            })?;

        let diagnostics_port = match get(ENV_PROFILE_PORT) {
            Some(raw) => raw.trim().parse::<u16>().map_err(|e| {
                AdapterError::InvalidConfiguration(format!(
                    "{} must be a port number, got {:?}: {}",
                    ENV_PROFILE_PORT, raw, e
                ))
            })?,
            None => DEFAULT_DIAGNOSTICS_PORT,
        };

        let shutdown_grace = match get(ENV_SHUTDOWN_GRACE) {
            Some(raw) => Duration::from_secs(raw.trim().parse::<u64>().map_err(|e| {
                AdapterError::InvalidConfiguration(format!(
                    "{} must be a number of seconds, got {:?}: {}",
                    ENV_SHUTDOWN_GRACE, raw, e
                ))
            })?),
            None => DEFAULT_SHUTDOWN_GRACE,
        };

        Ok(BootConfig {
            pod_name,
            namespace,
            diagnostics_port,
            logging_config_map: get(ENV_LOGGING_CONFIG_MAP)
                .unwrap_or_else(|| DEFAULT_LOGGING_CONFIG_MAP.to_string()),
            observability_config_map: get(ENV_OBSERVABILITY_CONFIG_MAP)
                .unwrap_or_else(|| DEFAULT_OBSERVABILITY_CONFIG_MAP.to_string()),
            kubernetes_min_version,
            version_timeout: DEFAULT_VERSION_TIMEOUT,
            version_poll_interval: DEFAULT_VERSION_POLL_INTERVAL,
            shutdown_grace,
        })
    }
}

fn missing(key: &str) -> AdapterError {
    AdapterError::InvalidConfiguration(format!("required environment variable {} is not set", key))
}
