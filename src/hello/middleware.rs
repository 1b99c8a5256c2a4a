//! Request middleware for probe traffic
//!
//! - `probe_middleware` answers network probes identified by a header
//! - `kubelet_healthz_middleware` answers kubelet health probes

use axum::{
    extract::{Request, State},
    http::{header::USER_AGENT, HeaderName, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Header set by the networking layer when probing a revision
pub const PROBE_HEADER: &str = "k-network-probe";

/// User-Agent prefix sent by the kubelet
pub const KUBELET_PROBE_PREFIX: &str = "kube-probe/";

/// Expected probe header and the value it must carry
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    header: HeaderName,
    value: String,
}

impl ProbeConfig {
    pub fn new(header: HeaderName, value: impl Into<String>) -> Self {
        ProbeConfig {
            header,
            value: value.into(),
        }
    }
}

/// Short-circuit requests carrying the probe header
///
/// A matching value gets 200 with the value as body, anything else 400.
/// Requests without the header go to the next handler.
pub async fn probe_middleware(
    State(config): State<Arc<ProbeConfig>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(raw) = request.headers().get(&config.header) else {
        return next.run(request).await;
    };

    match raw.to_str() {
        Ok(value) if value == config.value => {
            debug!(header = %config.header, "Answered network probe");
            (StatusCode::OK, config.value.clone()).into_response()
        }
        other => {
            let got = other.unwrap_or("<non-ascii>");
            warn!(header = %config.header, value = %got, "Unexpected probe header value");
            (
                StatusCode::BAD_REQUEST,
                format!("unexpected probe header value: {:?}", got),
            )
                .into_response()
        }
    }
}

/// Health check run for kubelet probes
pub type HealthCheck = Arc<dyn Fn() -> Result<(), String> + Send + Sync>;

/// Always healthy
pub fn always_healthy() -> HealthCheck {
    Arc::new(|| Ok(()))
}

pub fn is_kubelet_probe(request: &Request) -> bool {
    request
        .headers()
        .get(USER_AGENT)
        .and_then(|ua| ua.to_str().ok())
        .is_some_and(|ua| ua.starts_with(KUBELET_PROBE_PREFIX))
}

/// Answer kubelet probes with the health check result, pass everything else on
pub async fn kubelet_healthz_middleware(
    State(check): State<HealthCheck>,
    request: Request,
    next: Next,
) -> Response {
    if !is_kubelet_probe(&request) {
        return next.run(request).await;
    }

    match check() {
        Ok(()) => StatusCode::OK.into_response(),
        Err(reason) => {
            warn!(reason = %reason, "Health check failed");
            (StatusCode::INTERNAL_SERVER_ERROR, reason).into_response()
        }
    }
}
