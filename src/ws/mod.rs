use axum::{Router, routing::get};

use crate::state::AppState;

mod handler;
pub mod model;

pub fn api<S>(s: AppState) -> Router<S> {
    Router::new()
        .route("/ws", get(handler::ws))
        .with_state(s)
}
