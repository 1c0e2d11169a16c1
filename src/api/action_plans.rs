//! REST endpoints for action plans and the manual Notion sync trigger.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::action_plans::{self, ActionPlan, ActionPlanStatus, CostType, SyncReport, notion};
use crate::checklist::queue::ActionPlanDraft;
use crate::error::SyncError;

#[derive(Debug, Deserialize)]
struct PlanFilter {
    status: Option<ActionPlanStatus>,
    #[serde(default)]
    overdue: bool,
}

/// Create a plan from a queued draft or from scratch. Explicit fields win
/// over the draft's.
#[derive(Debug, Deserialize)]
pub struct CreateActionPlan {
    pub user_id: String,
    #[serde(default)]
    pub draft: Option<ActionPlanDraft>,
    #[serde(default)]
    pub checklist_id: Option<Uuid>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub problem: Option<String>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub cost_type: Option<CostType>,
    #[serde(default)]
    pub estimated_cost: Option<Decimal>,
    #[serde(default)]
    pub xp_reward: Option<u32>,
}

impl CreateActionPlan {
    pub(super) fn into_plan(self) -> Result<ActionPlan, ApiError> {
        let mut plan = match (&self.draft, self.checklist_id) {
            (Some(draft), Some(checklist_id)) => {
                ActionPlan::from_draft(draft, self.user_id.as_str(), checklist_id)?
            }
            (Some(_), None) => {
                return Err(ApiError::BadRequest(
                    "checklist_id is required with a draft".into(),
                ));
            }
            (None, _) => {
                let title = self.title.clone().unwrap_or_default();
                let mut plan = ActionPlan::new(self.user_id.as_str(), title)?;
                plan.checklist_id = self.checklist_id;
                plan
            }
        };

        if let Some(title) = self.title.filter(|t| !t.trim().is_empty()) {
            plan.title = title;
        }
        if let Some(problem) = self.problem {
            plan = plan.with_problem(problem);
        }
        if let Some(due) = self.due_date {
            plan = plan.with_due_date(due);
        }
        if self.cost_type.is_some() || self.estimated_cost.is_some() {
            plan = plan.with_cost(self.cost_type.unwrap_or_default(), self.estimated_cost);
        }
        if let Some(xp) = self.xp_reward {
            plan = plan.with_xp_reward(xp);
        }
        Ok(plan)
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusChange {
    pub status: ActionPlanStatus,
}

pub fn action_plan_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/action-plans", get(list_plans).post(create_plan))
        .route("/api/action-plans/sync", post(sync_plans))
        .route("/api/action-plans/{id}", get(get_plan))
        .route("/api/action-plans/{id}/status", post(change_status))
        .with_state(state)
}

async fn list_plans(
    State(state): State<AppState>,
    Query(filter): Query<PlanFilter>,
) -> Result<Json<Vec<ActionPlan>>, ApiError> {
    let mut plans = state.db.list_action_plans(filter.status).await?;
    if filter.overdue {
        let today = Utc::now().date_naive();
        plans.retain(|p| p.is_overdue(today));
    }
    Ok(Json(plans))
}

async fn create_plan(
    State(state): State<AppState>,
    Json(body): Json<CreateActionPlan>,
) -> Result<(StatusCode, Json<ActionPlan>), ApiError> {
    let plan = body.into_plan()?;
    state.db.insert_action_plan(&plan).await?;
    info!(plan_id = %plan.id, user_id = %plan.user_id, "Action plan created");
    Ok((StatusCode::CREATED, Json(plan)))
}

async fn get_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ActionPlan>, ApiError> {
    state
        .db
        .get_action_plan(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("action plan", id))
}

async fn change_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<StatusChange>,
) -> Result<Json<ActionPlan>, ApiError> {
    let mut plan = state
        .db
        .get_action_plan(id)
        .await?
        .ok_or_else(|| ApiError::not_found("action plan", id))?;
    let from = plan.status;
    let earned = plan.transition(body.status)?;
    if !state.db.update_action_plan(&plan, from).await? {
        return Err(ApiError::Conflict(format!(
            "action plan {id} changed while moving to {}",
            body.status.as_str()
        )));
    }
    action_plans::award_resolution_xp(state.db.as_ref(), &plan.user_id, earned).await?;
    Ok(Json(plan))
}

async fn sync_plans(State(state): State<AppState>) -> Result<Json<SyncReport>, ApiError> {
    let client = state.notion.as_ref().ok_or(SyncError::NotConfigured)?;
    Ok(Json(notion::sync(state.db.as_ref(), client).await?))
}
