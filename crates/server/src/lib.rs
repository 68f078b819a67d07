//! HTTP boundary: routers, state, and error mapping.

use axum::Router;
use db::DBService;
use tower_http::trace::TraceLayer;

pub mod config;
pub mod error;
pub mod routes;

#[derive(Clone)]
pub struct AppState {
    pub db: DBService,
}

impl AppState {
    pub fn new(db: DBService) -> Self {
        Self { db }
    }
}

/// Assemble the full application router.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .merge(routes::health::router())
        .merge(routes::assign::router())
        .merge(routes::projects::router())
        .merge(routes::experiments::router())
        .merge(routes::variants::router());

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
