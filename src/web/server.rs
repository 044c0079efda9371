//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

use super::guard::{enforce_routes, RouteGuard, SharedLimiter};
use super::service::{check, health, list_policies, AppState};
use crate::error::Result;
use crate::ratelimit::PolicyTable;

/// Header carrying the per-request correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// HTTP server for the rate limit service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Shared handler state
    state: AppState,
    /// Whether forwarding headers identify clients
    trust_proxy_headers: bool,
}

impl HttpServer {
    /// Create a new server.
    pub fn new(
        addr: SocketAddr,
        limiter: SharedLimiter,
        policies: Arc<PolicyTable>,
        backend: &'static str,
    ) -> Self {
        Self {
            addr,
            state: AppState {
                limiter,
                policies,
                backend,
            },
            trust_proxy_headers: true,
        }
    }

    pub fn trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }

    /// The full application, including the route guard.
    ///
    /// Only paths the policy table binds explicitly are limited, so callers
    /// of the check endpoint are never throttled by the default policy.
    pub fn router(&self) -> Router {
        let routes = RouteGuard::new(self.state.limiter.clone(), self.state.policies.clone())
            .trust_proxy_headers(self.trust_proxy_headers)
            .bound_routes_only();

        Router::new()
            .route("/health", get(health))
            .route("/v1/policies", get(list_policies))
            .route("/v1/ratelimit/check", post(check))
            .with_state(self.state.clone())
            .layer(middleware::from_fn_with_state(routes, enforce_routes))
            .layer(middleware::from_fn(request_id))
    }

    /// Serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let listener = TcpListener::bind(self.addr).await?;

        info!(
            addr = %self.addr,
            store = self.state.backend,
            "Starting HTTP server with graceful shutdown"
        );

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}

/// Tag every request and response with a correlation id.
async fn request_id(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .cloned()
        .unwrap_or_else(|| {
            HeaderValue::from_str(&Uuid::new_v4().to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("invalid"))
        });
    request.headers_mut().insert(REQUEST_ID_HEADER, id.clone());

    let mut response = next.run(request).await;
    response.headers_mut().insert(REQUEST_ID_HEADER, id);
    response
}
