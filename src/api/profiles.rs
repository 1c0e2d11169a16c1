//! Player profile lookup.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use super::{ApiError, AppState};
use crate::gamification::{Badge, Profile, xp_for_level};

#[derive(Debug, Serialize)]
pub struct ProfileView {
    #[serde(flatten)]
    pub profile: Profile,
    pub badges: Vec<Badge>,
    /// Total XP at which the next level is reached.
    pub next_level_xp: u64,
}

impl From<Profile> for ProfileView {
    fn from(profile: Profile) -> Self {
        Self {
            badges: profile.badges(),
            next_level_xp: xp_for_level(profile.level + 1),
            profile,
        }
    }
}

pub fn profile_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/profiles/{user_id}", get(get_profile))
        .with_state(state)
}

/// Unknown users get a fresh level-1 profile rather than a 404.
async fn get_profile(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<ProfileView>, ApiError> {
    let profile = state
        .db
        .get_profile(&user_id)
        .await?
        .unwrap_or_else(|| Profile::new(user_id));
    Ok(Json(profile.into()))
}
