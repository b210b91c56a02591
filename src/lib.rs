use axum::{Router, middleware, routing::get};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use integration::Env;
use state::AppState;

pub mod error;
pub mod hub;
pub mod identity;
pub mod integration;
pub mod message;
pub mod notification;
pub mod participant;
pub mod room;
pub mod schema;
pub mod state;
pub mod user;
pub mod ws;

pub type Result<T> = std::result::Result<T, error::Error>;

pub fn router(state: AppState, env: &Env) -> Router {
    let api = Router::new()
        .merge(room::api(state.clone()))
        .merge(notification::api(state.clone()))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            identity::middleware::resolve,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(ws::api(state))
        .nest("/api", api)
        .layer(
            CorsLayer::new()
                .allow_origin(env.allow_origin())
                .allow_methods(env.allow_methods())
                .allow_headers(env.allow_headers()),
        )
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "OK"
}
