//! HTTP and WebSocket surface.
//!
//! Each resource module builds its own `Router` over the shared [`AppState`];
//! [`router`] merges them and adds the health check and CORS layer.

pub mod action_plans;
pub mod checklists;
pub mod duels;
pub mod error;
pub mod profiles;
pub mod templates;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

use crate::action_plans::NotionClient;
use crate::config::ScoringConfig;
use crate::evidence::FallbackStore;
use crate::store::Database;

pub use duels::DuelEvent;
pub use error::ApiError;

/// Largest accepted request body; evidence photos come straight from phones.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub scoring: ScoringConfig,
    pub evidence: Arc<FallbackStore>,
    /// `None` when Notion sync is not configured.
    pub notion: Option<Arc<NotionClient>>,
    /// Fan-out of duel changes to `/ws/duels` clients.
    pub duel_tx: broadcast::Sender<DuelEvent>,
}

impl AppState {
    pub fn new(
        db: Arc<dyn Database>,
        scoring: ScoringConfig,
        evidence: Arc<FallbackStore>,
        notion: Option<Arc<NotionClient>>,
    ) -> Self {
        let (duel_tx, _) = broadcast::channel(256);
        Self {
            db,
            scoring,
            evidence,
            notion,
            duel_tx,
        }
    }

    /// Push a duel event to connected clients. No subscribers is fine.
    pub fn broadcast(&self, event: DuelEvent) {
        let _ = self.duel_tx.send(event);
    }
}

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(templates::template_routes(state.clone()))
        .merge(checklists::checklist_routes(state.clone()))
        .merge(action_plans::action_plan_routes(state.clone()))
        .merge(duels::duel_routes(state.clone()))
        .merge(profiles::profile_routes(state))
        .layer(
            ServiceBuilder::new()
                .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
                .layer(CorsLayer::permissive()),
        )
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "shiftcheck"
    }))
}
