//! HTTP middleware adapter for the sliding window limiter.

use std::future::Future;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::info;

use super::identifier::RequestMeta;
use crate::ratelimit::{
    CounterStore, PolicyTable, RateLimitDecision, RateLimitPolicy, SlidingWindowLimiter,
};

/// The limiter type shared by every HTTP guard.
pub type SharedLimiter = SlidingWindowLimiter<dyn CounterStore>;

/// Binds a limiter to one policy and applies it to requests.
#[derive(Clone)]
pub struct RateLimitGuard {
    limiter: SharedLimiter,
    policy: Arc<RateLimitPolicy>,
    trust_proxy_headers: bool,
}

impl RateLimitGuard {
    pub fn new(limiter: SharedLimiter, policy: Arc<RateLimitPolicy>) -> Self {
        Self {
            limiter,
            policy,
            trust_proxy_headers: true,
        }
    }

    /// Whether `X-Forwarded-For` and friends name the client.
    pub fn trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }

    pub fn policy(&self) -> &Arc<RateLimitPolicy> {
        &self.policy
    }

    /// Bucket identifier for `request` under this guard's policy.
    pub fn identify<B>(&self, request: &Request<B>) -> String {
        let meta = RequestMeta::from_request(request).trust_proxy_headers(self.trust_proxy_headers);
        self.policy.identifier().identify(&meta)
    }

    /// Run the limiter for `request`.
    ///
    /// The identifier is derived before the returned future is polled, so the
    /// future does not borrow the request.
    pub fn check_request<B>(
        &self,
        request: &Request<B>,
    ) -> impl Future<Output = RateLimitDecision> + Send + 'static {
        let identifier = self.identify(request);
        let guard = self.clone();
        async move { guard.limiter.check(&identifier, &guard.policy).await }
    }

    /// `Some(response)` when the request must be rejected, `None` to let it
    /// through.
    pub fn middleware<B>(
        &self,
        request: &Request<B>,
    ) -> impl Future<Output = Option<Response>> + Send + 'static {
        let decision = self.check_request(request);
        let policy = self.policy.clone();
        async move {
            let decision = decision.await;
            (!decision.allowed).then(|| rejection_response(&policy, &decision))
        }
    }
}

/// Build the rejection for `decision` in the shape `policy` prescribes.
pub fn rejection_response(policy: &RateLimitPolicy, decision: &RateLimitDecision) -> Response {
    let body = decision.rejection_body(policy.message());
    let mut response = (policy.status_code(), Json(body)).into_response();
    response.headers_mut().extend(decision.headers());
    response
}

/// axum middleware enforcing a single policy.
///
/// ```rust,ignore
/// let app = Router::new()
///     .route("/login", post(login))
///     .layer(axum::middleware::from_fn_with_state(guard, enforce));
/// ```
pub async fn enforce(State(guard): State<RateLimitGuard>, request: Request, next: Next) -> Response {
    let decision = guard.check_request(&request).await;
    finish(&guard.policy, decision, request, next).await
}

/// Picks the policy for each request from a [`PolicyTable`] by path.
///
/// Paths without a route binding fall back to the table's default policy,
/// unless the guard is restricted with [`RouteGuard::bound_routes_only`].
#[derive(Clone)]
pub struct RouteGuard {
    limiter: SharedLimiter,
    table: Arc<PolicyTable>,
    trust_proxy_headers: bool,
    bound_only: bool,
}

impl RouteGuard {
    pub fn new(limiter: SharedLimiter, table: Arc<PolicyTable>) -> Self {
        Self {
            limiter,
            table,
            trust_proxy_headers: true,
            bound_only: false,
        }
    }

    pub fn trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }

    /// Leave paths no route binds unlimited instead of applying the default.
    pub fn bound_routes_only(mut self) -> Self {
        self.bound_only = true;
        self
    }

    /// The single-policy guard governing `path`.
    pub fn guard_for(&self, path: &str) -> RateLimitGuard {
        self.guard(self.table.policy_for_path(path))
    }

    /// The guard to apply to `path`, or `None` when it goes unlimited.
    pub fn select(&self, path: &str) -> Option<RateLimitGuard> {
        if self.bound_only {
            self.table.bound_policy(path).map(|policy| self.guard(policy))
        } else {
            Some(self.guard_for(path))
        }
    }

    fn guard(&self, policy: &Arc<RateLimitPolicy>) -> RateLimitGuard {
        RateLimitGuard::new(self.limiter.clone(), policy.clone())
            .trust_proxy_headers(self.trust_proxy_headers)
    }
}

/// axum middleware enforcing whichever policy the table binds to the path.
pub async fn enforce_routes(
    State(routes): State<RouteGuard>,
    request: Request,
    next: Next,
) -> Response {
    let Some(guard) = routes.select(request.uri().path()) else {
        return next.run(request).await;
    };
    let decision = guard.check_request(&request).await;
    finish(&guard.policy, decision, request, next).await
}

/// Reject, or run the rest of the stack and attach informational headers.
async fn finish(
    policy: &RateLimitPolicy,
    decision: RateLimitDecision,
    request: Request,
    next: Next,
) -> Response {
    if !decision.allowed {
        info!(
            path = %request.uri().path(),
            scope = policy.scope().unwrap_or("-"),
            limit = decision.limit,
            "Rejecting rate limited request"
        );
        return rejection_response(policy, &decision);
    }

    let mut response = next.run(request).await;
    response.headers_mut().extend(decision.headers());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{InMemoryStore, ManualClock, RejectionBody};
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn limiter_at(now_ms: i64) -> (Arc<ManualClock>, SharedLimiter) {
        let clock = Arc::new(ManualClock::new(now_ms));
        let store: Arc<dyn CounterStore> = Arc::new(InMemoryStore::with_clock(clock.clone()));
        (clock.clone(), SlidingWindowLimiter::with_clock(store, clock))
    }

    fn request(path: &str, ip: Option<&str>) -> Request {
        let mut builder = http::Request::builder().uri(path);
        if let Some(ip) = ip {
            builder = builder.header("x-forwarded-for", ip);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> RejectionBody {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_middleware_passes_then_rejects() {
        let (_clock, limiter) = limiter_at(0);
        let policy = Arc::new(RateLimitPolicy::from_millis(1000, 2));
        let guard = RateLimitGuard::new(limiter, policy);

        assert!(guard.middleware(&request("/items", Some("10.0.0.1"))).await.is_none());
        assert!(guard.middleware(&request("/items", Some("10.0.0.1"))).await.is_none());

        let response = guard
            .middleware(&request("/items", Some("10.0.0.1")))
            .await
            .expect("third request should be rejected");
        assert_eq!(response.status(), http::StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["x-ratelimit-limit"], "2");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
        assert_eq!(response.headers()["x-ratelimit-reset"], "1000");
        assert_eq!(response.headers()["retry-after"], "1");

        let body = body_json(response).await;
        assert_eq!(body.error, crate::ratelimit::DEFAULT_MESSAGE);
        assert_eq!(body.limit, 2);
        assert_eq!(body.remaining, 0);
        assert_eq!(body.reset, 1000);
        assert_eq!(body.retry_after, 1);
    }

    #[tokio::test]
    async fn test_paths_are_limited_separately() {
        let (_clock, limiter) = limiter_at(0);
        let guard = RateLimitGuard::new(limiter, Arc::new(RateLimitPolicy::from_millis(1000, 1)));

        assert!(guard.middleware(&request("/a", Some("10.0.0.1"))).await.is_none());
        assert!(guard.middleware(&request("/b", Some("10.0.0.1"))).await.is_none());
        assert!(guard.middleware(&request("/a", Some("10.0.0.1"))).await.is_some());
    }

    #[tokio::test]
    async fn test_anonymous_clients_share_unknown_bucket() {
        let (_clock, limiter) = limiter_at(0);
        let guard = RateLimitGuard::new(limiter, Arc::new(RateLimitPolicy::from_millis(1000, 2)));

        let anonymous = request("/reports", None);
        assert_eq!(guard.identify(&anonymous), "unknown:/reports");

        assert!(guard.middleware(&request("/reports", None)).await.is_none());
        assert!(guard.middleware(&request("/reports", None)).await.is_none());
        assert!(guard.middleware(&request("/reports", None)).await.is_some());

        // A client with an address is unaffected.
        assert!(guard.middleware(&request("/reports", Some("10.0.0.9"))).await.is_none());
    }

    #[tokio::test]
    async fn test_custom_status_and_message() {
        let (_clock, limiter) = limiter_at(0);
        let policy = RateLimitPolicy::from_millis(60_000, 1)
            .with_message("Slow down")
            .with_status(http::StatusCode::SERVICE_UNAVAILABLE);
        let guard = RateLimitGuard::new(limiter, Arc::new(policy));

        guard.middleware(&request("/x", Some("10.0.0.1"))).await;
        let response = guard
            .middleware(&request("/x", Some("10.0.0.1")))
            .await
            .unwrap();

        assert_eq!(response.status(), http::StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["retry-after"], "60");
        assert_eq!(body_json(response).await.error, "Slow down");
    }

    #[tokio::test]
    async fn test_retry_after_constant_across_window() {
        let (clock, limiter) = limiter_at(0);
        let guard = RateLimitGuard::new(limiter, Arc::new(RateLimitPolicy::from_millis(10_000, 1)));

        guard.middleware(&request("/x", Some("10.0.0.1"))).await;

        for t in [1, 5_000, 9_999] {
            clock.set(t);
            let response = guard
                .middleware(&request("/x", Some("10.0.0.1")))
                .await
                .unwrap();
            assert_eq!(response.headers()["retry-after"], "10");
        }
    }

    #[tokio::test]
    async fn test_enforce_layer_adds_informational_headers() {
        let (_clock, limiter) = limiter_at(0);
        let guard = RateLimitGuard::new(limiter, Arc::new(RateLimitPolicy::from_millis(1000, 2)));
        let app = Router::new()
            .route("/items", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(guard, enforce));

        let response = app
            .clone()
            .oneshot(request("/items", Some("10.0.0.1")))
            .await
            .unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "2");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "1");
        assert!(response.headers().get("retry-after").is_none());

        app.clone()
            .oneshot(request("/items", Some("10.0.0.1")))
            .await
            .unwrap();
        let response = app
            .oneshot(request("/items", Some("10.0.0.1")))
            .await
            .unwrap();
        assert_eq!(response.status(), http::StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_route_guard_applies_independent_presets() {
        let (clock, limiter) = limiter_at(0);
        let table = PolicyTable::from_yaml(
            r#"
routes:
  - path_prefix: /api/auth
    policy: auth
"#,
        )
        .unwrap();
        let routes = RouteGuard::new(limiter.clone(), Arc::new(table.clone()));
        let app = Router::new()
            .route("/api/auth/login", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(routes, enforce_routes));

        for _ in 0..5 {
            clock.advance(1_000);
            let response = app
                .clone()
                .oneshot(request("/api/auth/login", Some("10.0.0.1")))
                .await
                .unwrap();
            assert_eq!(response.status(), http::StatusCode::OK);
        }

        clock.advance(1_000);
        let response = app
            .oneshot(request("/api/auth/login", Some("10.0.0.1")))
            .await
            .unwrap();
        assert_eq!(response.status(), http::StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "900");

        // The general api preset still has room for the same request.
        let api = RateLimitGuard::new(limiter, table.get("api").unwrap().clone());
        assert!(api
            .middleware(&request("/api/auth/login", Some("10.0.0.1")))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_user_identifier_strategy() {
        let (_clock, limiter) = limiter_at(0);
        let policy = RateLimitPolicy::from_millis(1000, 1).with_identifier(
            crate::ratelimit::IdentifierStrategy::User {
                header: "x-user-id".to_string(),
            },
        );
        let guard = RateLimitGuard::new(limiter, Arc::new(policy));

        let mut from_office = request("/x", Some("10.0.0.1"));
        from_office
            .headers_mut()
            .insert("x-user-id", "alice".parse().unwrap());
        assert_eq!(guard.identify(&from_office), "user:alice");
        assert!(guard.middleware(&from_office).await.is_none());

        // Same user from another address shares the bucket.
        let mut from_home = request("/y", Some("10.0.0.2"));
        from_home
            .headers_mut()
            .insert("x-user-id", "alice".parse().unwrap());
        assert!(guard.middleware(&from_home).await.is_some());
    }

    #[tokio::test]
    async fn test_guard_for_uses_table() {
        let (_clock, limiter) = limiter_at(0);
        let routes = RouteGuard::new(limiter, Arc::new(PolicyTable::presets()));
        assert_eq!(routes.guard_for("/anything").policy().max_requests(), 60);
        assert!(routes.select("/anything").is_some());
    }

    #[tokio::test]
    async fn test_bound_routes_only_skips_unbound_paths() {
        let (_clock, limiter) = limiter_at(0);
        let table = PolicyTable::from_yaml(
            r#"
routes:
  - path_prefix: /admin
    policy: sensitive
"#,
        )
        .unwrap();
        let routes = RouteGuard::new(limiter, Arc::new(table)).bound_routes_only();
        assert!(routes.select("/status").is_none());
        assert_eq!(routes.select("/admin/users").unwrap().policy().max_requests(), 3);

        let app = Router::new()
            .route("/status", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(routes, enforce_routes));

        for _ in 0..70 {
            let response = app
                .clone()
                .oneshot(request("/status", Some("10.0.0.1")))
                .await
                .unwrap();
            assert_eq!(response.status(), http::StatusCode::OK);
            assert!(response.headers().get("x-ratelimit-limit").is_none());
        }
    }
}
