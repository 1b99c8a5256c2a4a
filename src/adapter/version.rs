//! Startup gate on the Kubernetes API server version
//!
//! Both the discovered and the required version are canonicalized to
//! major.minor.patch before comparison. Pre-release and build suffixes
//! (`v1.15.3-gke.2`, `v1.16.0+k3s1`) are dropped.

use crate::error::AdapterError;
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum VersionError {
    #[error("Failed to discover server version: {0}")]
    Discovery(#[from] kube::Error),

    #[error("Server version unavailable: {0}")]
    Unavailable(String),

    #[error("Minimum version must be set")]
    MissingMinimum,

    #[error("Unparseable version {0:?}")]
    Unparseable(String),

    #[error("Kubernetes version {current} is not compatible, need at least {minimum}")]
    TooOld {
        current: KubeVersion,
        minimum: KubeVersion,
    },
}

/// Anything that can report the API server's version string
///
/// `kube::Client` implements it through the discovery endpoint.
#[async_trait]
pub trait VersionSource: Send + Sync {
    async fn server_version(&self) -> Result<String, VersionError>;
}

#[async_trait]
impl VersionSource for kube::Client {
    async fn server_version(&self) -> Result<String, VersionError> {
        Ok(self.apiserver_version().await?.git_version)
    }
}

/// Canonical major.minor.patch version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KubeVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl FromStr for KubeVersion {
    type Err = VersionError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let unparseable = || VersionError::Unparseable(raw.to_string());

        let trimmed = raw.trim();
        let trimmed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        let core = trimmed
            .split(['-', '+'])
            .next()
            .filter(|c| !c.is_empty())
            .ok_or_else(unparseable)?;

        let mut parts = [0u64; 3];
        let mut count = 0;
        for segment in core.split('.') {
            if count == 3 {
                return Err(unparseable());
            }
            parts[count] = segment.parse::<u64>().map_err(|_| unparseable())?;
            count += 1;
        }

        Ok(KubeVersion {
            major: parts[0],
            minor: parts[1],
            patch: parts[2],
        })
    }
}

impl fmt::Display for KubeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

fn parse_minimum(minimum: &str) -> Result<KubeVersion, VersionError> {
    if minimum.trim().is_empty() {
        return Err(VersionError::MissingMinimum);
    }
    minimum.parse()
}

async fn check_against<S>(source: &S, minimum: KubeVersion) -> Result<KubeVersion, VersionError>
where
    S: VersionSource + ?Sized,
{
    let current: KubeVersion = source.server_version().await?.parse()?;
    if current < minimum {
        return Err(VersionError::TooOld { current, minimum });
    }
    Ok(current)
}

/// Single check of the server version against `minimum`
pub async fn check_minimum_version<S>(source: &S, minimum: &str) -> Result<(), VersionError>
where
    S: VersionSource + ?Sized,
{
    let minimum = parse_minimum(minimum)?;
    check_against(source, minimum).await.map(|_| ())
}

/// Poll until the server reports a version >= `minimum`
///
/// Checks immediately, then every `poll_interval`. Discovery errors count
/// as "not yet". An empty or unparseable `minimum` fails without polling.
pub async fn await_minimum_version<S>(
    source: &S,
    minimum: &str,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<(), AdapterError>
where
    S: VersionSource + ?Sized,
{
    let required = parse_minimum(minimum).map_err(|e| {
        AdapterError::InvalidConfiguration(format!("SYSTEM_KUBERNETES_MIN_VERSION: {}", e))
    })?;

    let poll = async {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match check_against(source, required).await {
                Ok(current) => return current,
                Err(e) => warn!(attempt = attempt, error = %e, "Kubernetes version check failed"),
            }
            tokio::time::sleep(poll_interval).await;
        }
    };

    match tokio::time::timeout(timeout, poll).await {
        Ok(current) => {
            info!(current = %current, minimum = %required, "Kubernetes version accepted");
            Ok(())
        }
        Err(_) => Err(AdapterError::PreconditionTimeout {
            minimum: minimum.to_string(),
            timeout,
        }),
    }
}
