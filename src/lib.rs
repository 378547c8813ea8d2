pub mod appresult;
pub mod calls;
pub mod config;
pub mod conversations;
pub mod hub;
pub mod notify;
pub mod participants;
pub mod presence;
pub mod protocol;
pub mod rooms;
pub mod ws;

pub use appresult::{AppError, AppResult};

use axum::{debug_handler, extract::{FromRef, State}, routing::get, Json, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use hub::{Hub, HubStats};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub hub: Hub,
}

pub fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws::connect))

        .nest("/conversations", conversations::router())

        .with_state(app_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[derive(serde::Serialize)]
struct Health {
    status: &'static str,
    #[serde(flatten)]
    stats: HubStats,
}

#[debug_handler(state = AppState)]
async fn health(State(hub): State<Hub>) -> Json<Health> {
    Json(Health { status: "ok", stats: hub.stats().await })
}
