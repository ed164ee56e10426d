//! Route configuration.

use crate::auth::auth_middleware;
use crate::handlers;
use crate::metrics::metrics_handler;
use crate::ratelimit::admin_rate_limit_middleware;
use crate::state::AppState;
use axum::Router;
use axum::middleware;
use axum::routing::{delete, get, patch, post, put};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route(
            "/v1/admin/tokens",
            post(handlers::create_token).get(handlers::list_tokens),
        )
        .route("/v1/admin/tokens/{token_id}", delete(handlers::revoke_token))
        .route(
            "/v1/admin/registries",
            post(handlers::create_registry).get(handlers::list_registries),
        )
        .route(
            "/v1/admin/registries/{registry_id}",
            get(handlers::get_registry).delete(handlers::delete_registry),
        )
        .route(
            "/v1/admin/registries/{registry_id}/upstreams",
            post(handlers::create_upstream).get(handlers::list_upstreams),
        )
        .route(
            "/v1/admin/registries/{registry_id}/cache_entries",
            get(handlers::list_cache_entries),
        )
        .route(
            "/v1/admin/upstreams/{upstream_id}",
            patch(handlers::update_upstream).delete(handlers::delete_upstream),
        )
        .route(
            "/v1/admin/groups/{group_id}/cleanup_policy",
            put(handlers::save_cleanup_policy)
                .get(handlers::get_cleanup_policy)
                .delete(handlers::delete_cleanup_policy),
        )
        .route(
            "/v1/admin/groups/{group_id}/cleanup_policy/run",
            post(handlers::run_cleanup_policy),
        )
        .route(
            "/v1/admin/groups/{group_id}/audit_events",
            get(handlers::list_audit_events),
        )
        .route(
            "/v1/admin/projects/{project_id}/package_files/{*path}",
            post(handlers::publish_package_file),
        )
        .layer(middleware::from_fn_with_state(
            state.rate_limit.clone(),
            admin_rate_limit_middleware,
        ));

    let api_routes = Router::new()
        // Unauthenticated so load balancers and k8s probes can reach it.
        .route("/v1/health", get(handlers::health_check))
        .route("/v1/auth/whoami", get(handlers::whoami))
        .merge(admin_routes);

    // `get` also answers HEAD.
    let registry_routes = Router::new()
        .route(
            "/registry/{registry_id}/{*path}",
            get(handlers::show)
                .put(handlers::upload)
                .post(handlers::upload),
        )
        .layer(middleware::from_fn(handlers::security_headers));

    let mut router = Router::new().merge(api_routes).merge(registry_routes);

    // SECURITY: when enabled, this endpoint MUST be network-restricted to
    // the Prometheus scrapers. See crate::metrics.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    // Layers run outermost first: TraceLayer -> Auth -> route layers -> Handler
    let router = router.layer(middleware::from_fn_with_state(
        state.clone(),
        auth_middleware,
    ));

    let router = if state.config.server.enable_tracing {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    };

    router.with_state(state)
}
