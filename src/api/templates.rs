//! REST endpoints for checklist templates.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::checklist::rules::RuleEvaluator;
use crate::checklist::schedule::ScheduleConfig;
use crate::checklist::versioning::{self, TemplateVersion};
use crate::checklist::{ChecklistTemplate, Difficulty, TemplateSection};

/// Template body accepted on create and update.
#[derive(Debug, Deserialize)]
pub struct TemplateInput {
    pub title: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub sector_id: Option<String>,
    #[serde(default)]
    pub difficulty: Difficulty,
    pub estimated_minutes: u32,
    #[serde(default)]
    pub schedule: Option<ScheduleConfig>,
    pub sections: Vec<TemplateSection>,
}

impl TemplateInput {
    fn apply_to(self, template: &mut ChecklistTemplate) {
        template.title = self.title;
        template.icon = self.icon;
        template.sector_id = self.sector_id;
        template.difficulty = self.difficulty;
        template.estimated_minutes = self.estimated_minutes;
        template.schedule = self.schedule;
        template.sections = self.sections;
    }
}

/// A template due on the requested day.
#[derive(Debug, Serialize, Deserialize)]
pub struct DueTemplate {
    pub template_id: Uuid,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct DueQuery {
    date: Option<NaiveDate>,
}

pub fn template_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/templates", get(list_templates).post(create_template))
        .route("/api/templates/due", get(due_templates))
        .route("/api/templates/{id}", get(get_template).put(update_template))
        .route("/api/templates/{id}/versions", get(list_versions))
        .with_state(state)
}

/// Validation run before any save: structure, then rule patterns.
fn check(template: &ChecklistTemplate) -> Result<(), ApiError> {
    template.validate()?;
    RuleEvaluator::for_template(template)?;
    Ok(())
}

async fn snapshot(
    state: &AppState,
    previous: Option<&ChecklistTemplate>,
    current: &ChecklistTemplate,
) -> Result<(), ApiError> {
    let version = TemplateVersion {
        template_id: current.id,
        version: current.version,
        diff: versioning::diff(previous, current),
        snapshot: current.clone(),
        created_at: current.updated_at,
    };
    state.db.insert_template_version(&version).await?;
    info!(
        template_id = %current.id,
        version = current.version,
        added = version.diff.added,
        removed = version.diff.removed,
        modified = version.diff.modified,
        "Template version recorded"
    );
    Ok(())
}

async fn list_templates(
    State(state): State<AppState>,
) -> Result<Json<Vec<ChecklistTemplate>>, ApiError> {
    Ok(Json(state.db.list_templates().await?))
}

async fn create_template(
    State(state): State<AppState>,
    Json(input): Json<TemplateInput>,
) -> Result<(StatusCode, Json<ChecklistTemplate>), ApiError> {
    let mut template = ChecklistTemplate::new(String::new(), 0);
    input.apply_to(&mut template);
    template.version = 1;
    check(&template)?;

    state.db.insert_template(&template).await?;
    snapshot(&state, None, &template).await?;
    info!(template_id = %template.id, title = %template.title, "Template created");
    Ok((StatusCode::CREATED, Json(template)))
}

async fn get_template(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ChecklistTemplate>, ApiError> {
    state
        .db
        .get_template(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("template", id))
}

async fn update_template(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<TemplateInput>,
) -> Result<Json<ChecklistTemplate>, ApiError> {
    let previous = state
        .db
        .get_template(id)
        .await?
        .ok_or_else(|| ApiError::not_found("template", id))?;

    let mut template = previous.clone();
    input.apply_to(&mut template);
    template.version = previous.version + 1;
    template.updated_at = Utc::now();
    check(&template)?;

    state.db.update_template(&template).await?;
    snapshot(&state, Some(&previous), &template).await?;
    Ok(Json(template))
}

async fn list_versions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<TemplateVersion>>, ApiError> {
    if state.db.get_template(id).await?.is_none() {
        return Err(ApiError::not_found("template", id));
    }
    Ok(Json(state.db.list_template_versions(id).await?))
}

/// Scheduled templates that fire on `date` (today, UTC, by default).
async fn due_templates(
    State(state): State<AppState>,
    Query(query): Query<DueQuery>,
) -> Result<Json<Vec<DueTemplate>>, ApiError> {
    let date = query.date.unwrap_or_else(|| Utc::now().date_naive());
    let mut due = Vec::new();
    for template in state.db.list_templates().await? {
        let Some(schedule) = &template.schedule else {
            continue;
        };
        if !schedule.occurs_on(date)? {
            continue;
        }
        due.push(DueTemplate {
            template_id: template.id,
            title: template.title.clone(),
            deadline: schedule.deadline_on(date)?,
        });
    }
    Ok(Json(due))
}
