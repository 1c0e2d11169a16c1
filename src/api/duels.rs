//! Duel REST endpoints and the `/ws/duels` live feed.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::error::DuelError;
use crate::gamification::{Duel, Settlement};

/// Attempts at a conditional duel write before giving up with 409.
const MAX_DUEL_RETRIES: usize = 3;

/// Messages sent over the duel WebSocket (server → client).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DuelEvent {
    /// Full list of duels (sent on connect and after a lag).
    DuelsSync { duels: Vec<Duel> },
    DuelCreated { duel: Duel },
    /// Accepted, declined, or progress moved.
    DuelUpdated { duel: Duel },
    DuelSettled { duel: Duel, settlement: Settlement },
}

impl DuelEvent {
    fn involves(&self, user_id: &str) -> bool {
        match self {
            Self::DuelsSync { .. } => true,
            Self::DuelCreated { duel } | Self::DuelUpdated { duel } | Self::DuelSettled { duel, .. } => {
                duel.is_participant(user_id)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateDuel {
    pub template_id: Uuid,
    pub challenger: String,
    pub opponent: String,
    pub wager: u32,
}

#[derive(Debug, Deserialize)]
pub struct DuelActor {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
struct UserFilter {
    user_id: Option<String>,
}

pub fn duel_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/duels", get(list_duels).post(create_duel))
        .route("/api/duels/{id}/accept", post(accept_duel))
        .route("/api/duels/{id}/decline", post(decline_duel))
        .route("/ws/duels", get(ws_handler))
        .with_state(state)
}

// ── Conditional updates ────────────────────────────────────────────────

/// Load, mutate and write back a duel, retrying when another writer
/// changed the row in between.
pub(crate) async fn mutate_duel<T>(
    state: &AppState,
    id: Uuid,
    mut apply: impl FnMut(&mut Duel) -> Result<T, DuelError>,
) -> Result<(Duel, T), ApiError> {
    for attempt in 1..=MAX_DUEL_RETRIES {
        let mut duel = state
            .db
            .get_duel(id)
            .await?
            .ok_or_else(|| ApiError::not_found("duel", id))?;
        let (status, stamp) = (duel.status, duel.updated_at);
        let out = apply(&mut duel)?;
        if state.db.update_duel(&duel, status, stamp).await? {
            return Ok((duel, out));
        }
        debug!(duel_id = %id, attempt, "Duel changed concurrently, retrying");
    }
    Err(ApiError::Conflict(format!(
        "duel {id} is being modified concurrently"
    )))
}

/// Push a progress update into every active duel `user_id` has on `template_id`.
pub(crate) async fn advance_progress(state: &AppState, user_id: &str, template_id: Uuid, progress: u8) {
    let duels = match state.db.list_active_duels(user_id, template_id).await {
        Ok(duels) => duels,
        Err(e) => {
            warn!(user_id, error = %e, "Failed to load active duels");
            return;
        }
    };
    for duel in duels {
        match mutate_duel(state, duel.id, |d| d.record_progress(user_id, progress)).await {
            Ok((duel, ())) => state.broadcast(DuelEvent::DuelUpdated { duel }),
            Err(e) => warn!(duel_id = %duel.id, error = ?e, "Failed to record duel progress"),
        }
    }
}

/// Record a finished run in every active duel on the template and pay out
/// any duel that settles.
pub(crate) async fn record_scores(
    state: &AppState,
    user_id: &str,
    template_id: Uuid,
    score: u32,
) -> Result<Vec<Settlement>, ApiError> {
    let mut settlements = Vec::new();
    for duel in state.db.list_active_duels(user_id, template_id).await? {
        let (duel, settled) =
            match mutate_duel(state, duel.id, |d| d.record_score(user_id, score)).await {
                Ok(done) => done,
                Err(e) => {
                    warn!(duel_id = %duel.id, error = ?e, "Failed to record duel score");
                    continue;
                }
            };
        match settled {
            Some(settlement) => {
                pay_out(state, &settlement).await?;
                info!(
                    duel_id = %duel.id,
                    winner = ?settlement.winner,
                    wager = settlement.wager,
                    "Duel settled"
                );
                state.broadcast(DuelEvent::DuelSettled {
                    duel,
                    settlement: settlement.clone(),
                });
                settlements.push(settlement);
            }
            None => state.broadcast(DuelEvent::DuelUpdated { duel }),
        }
    }
    Ok(settlements)
}

async fn pay_out(state: &AppState, settlement: &Settlement) -> Result<(), ApiError> {
    for user_id in [&settlement.winner, &settlement.loser].into_iter().flatten() {
        let delta = settlement.xp_delta(user_id);
        if delta == 0 {
            continue;
        }
        state.db.add_xp(user_id, delta).await?;
    }
    Ok(())
}

// ── REST ───────────────────────────────────────────────────────────────

async fn list_duels(
    State(state): State<AppState>,
    Query(filter): Query<UserFilter>,
) -> Result<Json<Vec<Duel>>, ApiError> {
    Ok(Json(state.db.list_duels(filter.user_id.as_deref()).await?))
}

async fn create_duel(
    State(state): State<AppState>,
    Json(body): Json<CreateDuel>,
) -> Result<(StatusCode, Json<Duel>), ApiError> {
    if state.db.get_template(body.template_id).await?.is_none() {
        return Err(ApiError::not_found("template", body.template_id));
    }
    let duel = Duel::new(body.template_id, body.challenger, body.opponent, body.wager)?;
    state.db.insert_duel(&duel).await?;
    info!(
        duel_id = %duel.id,
        challenger = %duel.challenger.user_id,
        opponent = %duel.opponent.user_id,
        wager = duel.wager,
        "Duel created"
    );
    state.broadcast(DuelEvent::DuelCreated { duel: duel.clone() });
    Ok((StatusCode::CREATED, Json(duel)))
}

async fn accept_duel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(actor): Json<DuelActor>,
) -> Result<Json<Duel>, ApiError> {
    let (duel, ()) = mutate_duel(&state, id, |d| d.accept(&actor.user_id)).await?;
    state.broadcast(DuelEvent::DuelUpdated { duel: duel.clone() });
    Ok(Json(duel))
}

async fn decline_duel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(actor): Json<DuelActor>,
) -> Result<Json<Duel>, ApiError> {
    let (duel, ()) = mutate_duel(&state, id, |d| d.decline(&actor.user_id)).await?;
    state.broadcast(DuelEvent::DuelUpdated { duel: duel.clone() });
    Ok(Json(duel))
}

// ── WebSocket ──────────────────────────────────────────────────────────

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(filter): Query<UserFilter>,
) -> impl IntoResponse {
    info!(user_id = ?filter.user_id, "Duel WebSocket client connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, state, filter.user_id))
}

async fn send_event(socket: &mut WebSocket, event: &DuelEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize duel event");
            true
        }
    }
}

async fn sync_message(state: &AppState, user_id: Option<&str>) -> Option<DuelEvent> {
    match state.db.list_duels(user_id).await {
        Ok(duels) => Some(DuelEvent::DuelsSync { duels }),
        Err(e) => {
            warn!(error = %e, "Failed to load duels for sync");
            None
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState, user_id: Option<String>) {
    // Subscribe before the initial sync so nothing slips between the two.
    let mut rx = state.duel_tx.subscribe();

    if let Some(sync) = sync_message(&state, user_id.as_deref()).await {
        if !send_event(&mut socket, &sync).await {
            warn!("Failed to send initial duel sync, client disconnected");
            return;
        }
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if user_id.as_deref().is_some_and(|u| !event.involves(u)) {
                            continue;
                        }
                        if !send_event(&mut socket, &event).await {
                            debug!("Duel WS client disconnected during send");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Duel WS client lagged behind broadcast");
                        if let Some(sync) = sync_message(&state, user_id.as_deref()).await {
                            if !send_event(&mut socket, &sync).await {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Duel broadcast channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Duel WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Duel WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("Duel WebSocket connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_tagged_snake_case() {
        let duel = Duel::new(Uuid::new_v4(), "ana", "bo", 20).unwrap();
        let json = serde_json::to_value(DuelEvent::DuelCreated { duel }).unwrap();
        assert_eq!(json["type"], "duel_created");
        assert_eq!(json["duel"]["wager"], 20);
    }

    #[test]
    fn user_filter_matches_participants_only() {
        let duel = Duel::new(Uuid::new_v4(), "ana", "bo", 20).unwrap();
        let event = DuelEvent::DuelUpdated { duel };
        assert!(event.involves("ana"));
        assert!(event.involves("bo"));
        assert!(!event.involves("cy"));
        assert!(DuelEvent::DuelsSync { duels: vec![] }.involves("cy"));
    }
}
