//! `MageBox` team server.
//!
//! Wires the core library and the SQLite store into an Axum HTTP API for
//! invites, SSH identities and certificates, key synchronization onto
//! managed hosts, and the audit log.

pub mod auth;
pub mod bootstrap;
pub mod certs;
pub mod client_ip;
pub mod config;
pub mod error;
pub mod keysync;
pub mod maintenance;
pub mod middleware;
pub mod notify;
pub mod routes;
pub mod security;
pub mod state;
pub mod tasks;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::middleware as axum_mw;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::middleware::{
    audit_admin_failures, auth_middleware, guard_middleware, require_admin,
};
use crate::state::AppState;

/// Per-request time limit.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const CONTENT_SECURITY_POLICY: &str = "default-src 'none'; frame-ancestors 'none'";
const PERMISSIONS_POLICY: &str = "camera=(), microphone=(), geolocation=(), payment=()";
const STRICT_TRANSPORT_SECURITY: &str = "max-age=63072000; includeSubDomains";

/// Build the Axum router with all routes and middleware.
///
/// The binary must serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()`; the guard reads
/// the peer address from `ConnectInfo`.
pub fn build_router(state: Arc<AppState>) -> Router {
    let user_routes = routes::user_router().route_layer(axum_mw::from_fn_with_state(
        Arc::clone(&state),
        auth_middleware,
    ));

    // Layers added later run first: auth, the admin check, then failure
    // auditing around the handler.
    let admin_routes = Router::new()
        .nest("/api/admin", routes::admin_router())
        .route_layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            audit_admin_failures,
        ))
        .route_layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            require_admin,
        ))
        .route_layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            auth_middleware,
        ));

    let mut app = Router::new()
        .merge(routes::health::router())
        .merge(routes::join::router())
        .merge(user_routes)
        .merge(admin_routes)
        .layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            guard_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            REQUEST_TIMEOUT,
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static(CONTENT_SECURITY_POLICY),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("permissions-policy"),
            HeaderValue::from_static(PERMISSIONS_POLICY),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ));

    if state.config.tls_enabled {
        app = app.layer(SetResponseHeaderLayer::overriding(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static(STRICT_TRANSPORT_SECURITY),
        ));
    }

    app.with_state(state)
}
