//! HTTP adapter and server.

mod guard;
mod identifier;
mod server;
mod service;

pub use guard::{enforce, enforce_routes, rejection_response, RateLimitGuard, RouteGuard, SharedLimiter};
pub use identifier::{RequestMeta, UNKNOWN_CLIENT};
pub use server::HttpServer;
pub use service::{AppState, CheckRequest, CheckResponse};
