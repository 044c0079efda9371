//! JSON endpoints exposed by the Ratewarden server.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::guard::SharedLimiter;
use crate::ratelimit::{PolicyTable, RateLimitDecision};

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub limiter: SharedLimiter,
    pub policies: Arc<PolicyTable>,
    /// Name of the counter store backend, reported by `/health`
    pub backend: &'static str,
}

/// Body of `POST /v1/ratelimit/check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    /// Bucket identifier, e.g. `"203.0.113.9:/api/login"`
    pub identifier: String,
    /// Policy name; the table's default when omitted
    #[serde(default)]
    pub policy: Option<String>,
    /// Report usage without recording a request
    #[serde(default)]
    pub dry_run: bool,
}

/// Answer to a check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResponse {
    pub policy: String,
    #[serde(flatten)]
    pub decision: RateLimitDecision,
}

/// A policy as listed by `GET /v1/policies`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySummary {
    pub name: String,
    pub window_ms: i64,
    pub max_requests: u64,
    pub status_code: u16,
    pub message: String,
}

/// `GET /v1/policies` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyListing {
    pub policies: Vec<PolicySummary>,
    pub routes: Vec<RouteSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSummary {
    pub path_prefix: String,
    pub policy: String,
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "store": state.backend,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn list_policies(State(state): State<AppState>) -> Json<PolicyListing> {
    let mut policies: Vec<PolicySummary> = state
        .policies
        .iter()
        .map(|(name, policy)| PolicySummary {
            name: name.to_string(),
            window_ms: policy.window_ms(),
            max_requests: policy.max_requests(),
            status_code: policy.status_code().as_u16(),
            message: policy.message().to_string(),
        })
        .collect();
    policies.sort_by(|a, b| a.name.cmp(&b.name));

    let routes = state
        .policies
        .routes()
        .iter()
        .map(|(path_prefix, policy)| RouteSummary {
            path_prefix: path_prefix.clone(),
            policy: policy.clone(),
        })
        .collect();

    Json(PolicyListing { policies, routes })
}

/// Run a check on behalf of another service.
#[instrument(skip_all, fields(policy = ?request.policy, dry_run = request.dry_run))]
pub async fn check(State(state): State<AppState>, Json(request): Json<CheckRequest>) -> Response {
    if request.identifier.trim().is_empty() {
        warn!("Received rate limit check with empty identifier");
        return error(StatusCode::BAD_REQUEST, "identifier is required");
    }

    let name = request
        .policy
        .unwrap_or_else(|| state.policies.default_policy_name().to_string());
    let Some(policy) = state.policies.get(&name) else {
        return error(StatusCode::NOT_FOUND, format!("unknown policy '{}'", name));
    };

    let decision = if request.dry_run {
        state.limiter.peek(&request.identifier, policy).await
    } else {
        state.limiter.check(&request.identifier, policy).await
    };

    debug!(
        identifier = %request.identifier,
        allowed = decision.allowed,
        remaining = decision.remaining,
        "Rate limit decision made"
    );

    let headers = decision.headers();
    (headers, Json(CheckResponse { policy: name, decision })).into_response()
}
