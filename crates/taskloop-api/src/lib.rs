// HTTP control plane (C9): thin `axum` handlers over `taskloop-service`,
// documented with `utoipa` and served alongside a Swagger UI mount,
// matching `everruns-api`'s router-assembly convention.

pub mod dlq;
pub mod error;
pub mod health;
pub mod openapi;
pub mod scheduled;
pub mod state;
pub mod tasks;

use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use state::AppState;

/// Assembles every route group plus the Swagger UI mount behind one
/// `Router`, with CORS and request tracing applied last so they wrap the
/// whole surface (mirrors `everruns-api::main`'s layering order).
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .with_state(state.clone())
        .merge(tasks::routes(state.clone()))
        .merge(scheduled::routes(state.clone()))
        .merge(dlq::routes(state))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", openapi::ApiDoc::openapi()))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
}
