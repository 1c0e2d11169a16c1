//! Checklist execution endpoints: start, answer, evaluate, complete, then
//! work through the action-plan drafts and sign.
//!
//! The server owns scoring. Every answer write is also an activity event for
//! the focus timer, and the timer is replayed from those events on completion.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::action_plans::CreateActionPlan;
use super::{ApiError, AppState, duels};
use crate::action_plans::{ActionPlan, CostType};
use crate::checklist::queue::{ActionPlanDraft, ActionPlanQueue, DraftOutcome};
use crate::checklist::{
    ActivityTracker, Checklist, ChecklistResponse, ChecklistRun, ChecklistStatus, ChecklistTemplate,
    Completion, RunEvaluation,
};
use crate::error::{ChecklistError, EvidenceError};
use crate::evidence::{self, EvidenceStore, StoredEvidence};
use crate::gamification::{Profile, Settlement, StreakChange};

#[derive(Debug, Deserialize)]
pub struct StartChecklist {
    pub template_id: Uuid,
    pub user_id: String,
}

/// Responses not yet saved, layered over the stored ones.
#[derive(Debug, Default, Deserialize)]
pub struct EvaluateRequest {
    #[serde(default)]
    pub responses: Vec<ChecklistResponse>,
}

/// A signature here is only accepted when the run raises no drafts.
#[derive(Debug, Default, Deserialize)]
pub struct CompleteRequest {
    #[serde(default)]
    pub responses: Vec<ChecklistResponse>,
    #[serde(default)]
    pub signature: Option<String>,
}

/// Edits applied to the current draft before it becomes a plan.
#[derive(Debug, Default, Deserialize)]
pub struct SubmitDraft {
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

#[derive(Debug, Deserialize)]
pub struct SignRequest {
    pub signature: String,
}

#[derive(Debug, Serialize)]
pub struct DraftQueueView {
    pub checklist_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<ActionPlanDraft>,
    pub remaining: usize,
    pub outcomes: Vec<DraftOutcome>,
    pub skipped: Vec<Uuid>,
    pub ready_for_signature: bool,
}

impl DraftQueueView {
    fn new(checklist_id: Uuid, queue: &ActionPlanQueue) -> Self {
        Self {
            checklist_id,
            current: queue.current().cloned(),
            remaining: queue.len(),
            outcomes: queue.outcomes().to_vec(),
            skipped: queue.skipped(),
            ready_for_signature: queue.ready_for_signature(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubmittedDraft {
    pub plan: ActionPlan,
    pub drafts: DraftQueueView,
}

#[derive(Debug, Serialize)]
pub struct ChecklistView {
    pub checklist: Checklist,
    pub responses: Vec<ChecklistResponse>,
    pub evaluation: RunEvaluation,
}

#[derive(Debug, Serialize)]
pub struct CompletionView {
    pub checklist: Checklist,
    #[serde(flatten)]
    pub completion: Completion,
    pub xp_earned: u32,
    pub streak: StreakChange,
    pub profile: Profile,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub settlements: Vec<Settlement>,
}

#[derive(Debug, Deserialize)]
struct EvidenceQuery {
    question_id: Uuid,
}

pub fn checklist_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/checklists", post(start_checklist))
        .route("/api/checklists/{id}", get(get_checklist))
        .route("/api/checklists/{id}/responses", put(save_responses))
        .route("/api/checklists/{id}/evaluate", post(evaluate_checklist))
        .route("/api/checklists/{id}/complete", post(complete_checklist))
        .route("/api/checklists/{id}/drafts", get(get_drafts))
        .route("/api/checklists/{id}/drafts/submit", post(submit_draft))
        .route("/api/checklists/{id}/drafts/skip", post(skip_draft))
        .route("/api/checklists/{id}/sign", post(sign_checklist))
        .route("/api/checklists/{id}/evidence", post(upload_evidence))
        .route("/evidence/{*key}", get(serve_evidence))
        .with_state(state)
}

struct Loaded {
    checklist: Checklist,
    template: ChecklistTemplate,
    responses: Vec<ChecklistResponse>,
}

async fn load(state: &AppState, id: Uuid) -> Result<Loaded, ApiError> {
    let checklist = state
        .db
        .get_checklist(id)
        .await?
        .ok_or_else(|| ApiError::not_found("checklist", id))?;
    let (template, responses) = futures::try_join!(
        state.db.get_template(checklist.template_id),
        state.db.get_responses(id),
    )?;
    let template =
        template.ok_or_else(|| ApiError::not_found("template", checklist.template_id))?;
    Ok(Loaded {
        checklist,
        template,
        responses,
    })
}

fn ensure_open(checklist: &Checklist) -> Result<(), ChecklistError> {
    if checklist.status == ChecklistStatus::Completed {
        return Err(ChecklistError::AlreadyCompleted { id: checklist.id });
    }
    Ok(())
}

fn build_run(loaded: &Loaded, overlay: Vec<ChecklistResponse>) -> Result<ChecklistRun, ApiError> {
    let run = ChecklistRun::new(loaded.template.clone())?
        .with_responses(loaded.responses.iter().cloned())?
        .with_responses(overlay)?;
    Ok(run)
}

async fn start_checklist(
    State(state): State<AppState>,
    Json(body): Json<StartChecklist>,
) -> Result<(StatusCode, Json<Checklist>), ApiError> {
    let template = state
        .db
        .get_template(body.template_id)
        .await?
        .ok_or_else(|| ApiError::not_found("template", body.template_id))?;
    if body.user_id.trim().is_empty() {
        return Err(ApiError::BadRequest("user_id is required".into()));
    }

    let checklist = Checklist::start(&template, body.user_id);
    state.db.insert_checklist(&checklist).await?;
    state.db.record_activity(checklist.id, checklist.started_at).await?;
    info!(
        checklist_id = %checklist.id,
        template_id = %template.id,
        user_id = %checklist.user_id,
        "Checklist started"
    );
    Ok((StatusCode::CREATED, Json(checklist)))
}

async fn get_checklist(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ChecklistView>, ApiError> {
    let loaded = load(&state, id).await?;
    let evaluation = build_run(&loaded, Vec::new())?.evaluate();
    Ok(Json(ChecklistView {
        checklist: loaded.checklist,
        responses: loaded.responses,
        evaluation,
    }))
}

async fn save_responses(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(responses): Json<Vec<ChecklistResponse>>,
) -> Result<Json<RunEvaluation>, ApiError> {
    let loaded = load(&state, id).await?;
    ensure_open(&loaded.checklist)?;
    let evaluation = build_run(&loaded, responses.clone())?.evaluate();

    state.db.upsert_responses(id, &responses).await?;
    state.db.record_activity(id, Utc::now()).await?;

    let checklist = &loaded.checklist;
    duels::advance_progress(&state, &checklist.user_id, checklist.template_id, evaluation.progress)
        .await;
    Ok(Json(evaluation))
}

/// Evaluate without saving anything.
async fn evaluate_checklist(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<EvaluateRequest>,
) -> Result<Json<RunEvaluation>, ApiError> {
    let loaded = load(&state, id).await?;
    Ok(Json(build_run(&loaded, body.responses)?.evaluate()))
}

async fn complete_checklist(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CompleteRequest>,
) -> Result<Json<CompletionView>, ApiError> {
    let loaded = load(&state, id).await?;
    ensure_open(&loaded.checklist)?;

    let now = Utc::now();
    let today = now.date_naive();
    let activity = state.db.get_activity(id).await?;
    let timing = ActivityTracker::replay(loaded.checklist.started_at, activity, now);

    let run = build_run(&loaded, body.responses)?;
    let completion = run.complete(&timing, &state.scoring, today)?;

    let signature = body.signature.filter(|s| !s.trim().is_empty());
    if signature.is_some() && !completion.action_plans.ready_for_signature() {
        return Err(ChecklistError::SignaturePending {
            id,
            pending: completion.action_plans.len(),
        }
        .into());
    }

    let mut checklist = loaded.checklist;
    checklist.status = ChecklistStatus::Completed;
    checklist.score = Some(completion.score.total);
    checklist.conformity = completion.score.conformity;
    checklist.signature = signature;
    checklist.completed_at = Some(now);
    if !state
        .db
        .finish_checklist(&checklist, &completion.responses, &completion.action_plans)
        .await?
    {
        return Err(ChecklistError::AlreadyCompleted { id }.into());
    }

    let xp_earned = completion.score.total;
    let mut streak = StreakChange::Unchanged;
    let mut profile = state
        .db
        .modify_profile(&checklist.user_id, &mut |p: &mut Profile| {
            p.award_xp(i64::from(xp_earned));
            streak = p.record_completion(today);
        })
        .await?;

    let settlements = duels::record_scores(
        &state,
        &checklist.user_id,
        checklist.template_id,
        completion.score.total,
    )
    .await?;
    if !settlements.is_empty() {
        if let Some(settled) = state.db.get_profile(&checklist.user_id).await? {
            profile = settled;
        }
    }

    info!(
        checklist_id = %checklist.id,
        user_id = %checklist.user_id,
        score = completion.score.total,
        elapsed_secs = timing.elapsed_seconds,
        streak = ?streak,
        drafts = completion.action_plans.len(),
        "Checklist completed"
    );

    Ok(Json(CompletionView {
        checklist,
        completion,
        xp_earned,
        streak,
        profile,
        settlements,
    }))
}

/// A completed checklist and its stored draft queue.
async fn load_drafts(state: &AppState, id: Uuid) -> Result<(Checklist, ActionPlanQueue), ApiError> {
    let checklist = state
        .db
        .get_checklist(id)
        .await?
        .ok_or_else(|| ApiError::not_found("checklist", id))?;
    if checklist.status != ChecklistStatus::Completed {
        return Err(ChecklistError::NotCompleted { id }.into());
    }
    let queue = state.db.get_draft_queue(id).await?.unwrap_or_default();
    Ok((checklist, queue))
}

async fn store_advance(
    state: &AppState,
    id: Uuid,
    queue: &ActionPlanQueue,
    expected_pending: usize,
    plan: Option<&ActionPlan>,
) -> Result<(), ApiError> {
    if !state
        .db
        .advance_draft_queue(id, queue, expected_pending, plan)
        .await?
    {
        return Err(ApiError::Conflict(format!(
            "draft queue of checklist {id} was advanced concurrently"
        )));
    }
    Ok(())
}

async fn get_drafts(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DraftQueueView>, ApiError> {
    let (_, queue) = load_drafts(&state, id).await?;
    Ok(Json(DraftQueueView::new(id, &queue)))
}

/// Save the current draft, with any edits, as an action plan.
async fn submit_draft(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SubmitDraft>,
) -> Result<(StatusCode, Json<SubmittedDraft>), ApiError> {
    let (checklist, mut queue) = load_drafts(&state, id).await?;
    let expected = queue.len();
    let draft = queue
        .current()
        .cloned()
        .ok_or(ChecklistError::NoPendingDraft { id })?;

    let plan = CreateActionPlan {
        user_id: checklist.user_id,
        draft: Some(draft),
        checklist_id: Some(id),
        title: body.title,
        problem: body.problem,
        due_date: body.due_date,
        cost_type: body.cost_type,
        estimated_cost: body.estimated_cost,
        xp_reward: body.xp_reward,
    }
    .into_plan()?;
    queue.submit(plan.id);
    store_advance(&state, id, &queue, expected, Some(&plan)).await?;

    info!(checklist_id = %id, plan_id = %plan.id, remaining = queue.len(), "Draft saved as action plan");
    Ok((
        StatusCode::CREATED,
        Json(SubmittedDraft {
            plan,
            drafts: DraftQueueView::new(id, &queue),
        }),
    ))
}

/// Close the current draft without creating a plan.
async fn skip_draft(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DraftQueueView>, ApiError> {
    let (_, mut queue) = load_drafts(&state, id).await?;
    let expected = queue.len();
    let skipped = queue.skip().ok_or(ChecklistError::NoPendingDraft { id })?;
    store_advance(&state, id, &queue, expected, None).await?;

    info!(checklist_id = %id, question_id = %skipped.question_id, "Draft skipped");
    Ok(Json(DraftQueueView::new(id, &queue)))
}

/// Final step once every draft has been submitted or skipped.
async fn sign_checklist(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SignRequest>,
) -> Result<Json<Checklist>, ApiError> {
    let signature = body.signature.trim();
    if signature.is_empty() {
        return Err(ApiError::BadRequest("signature is required".into()));
    }
    let (mut checklist, queue) = load_drafts(&state, id).await?;
    if checklist.signature.is_some() {
        return Err(ChecklistError::AlreadySigned { id }.into());
    }
    if !queue.ready_for_signature() {
        return Err(ChecklistError::SignaturePending {
            id,
            pending: queue.len(),
        }
        .into());
    }
    if !state.db.sign_checklist(id, signature).await? {
        return Err(ChecklistError::AlreadySigned { id }.into());
    }

    checklist.signature = Some(signature.to_string());
    info!(checklist_id = %id, skipped = queue.skipped().len(), "Checklist signed");
    Ok(Json(checklist))
}

/// Store a photo for one answer and attach its URL to the response.
async fn upload_evidence(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<EvidenceQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<StoredEvidence>), ApiError> {
    let loaded = load(&state, id).await?;
    ensure_open(&loaded.checklist)?;
    if loaded.template.question(query.question_id).is_none() {
        return Err(ChecklistError::UnknownQuestion(query.question_id).into());
    }
    if body.is_empty() {
        return Err(ApiError::BadRequest("empty upload".into()));
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream");
    let key = evidence::evidence_key(id, query.question_id, evidence::extension_for(content_type));
    let stored = state.evidence.put(&key, content_type, body.to_vec()).await?;

    let mut response = loaded
        .responses
        .into_iter()
        .find(|r| r.question_id == query.question_id)
        .unwrap_or_else(|| ChecklistResponse::new(query.question_id));
    response.photo_urls.push(stored.url.clone());
    state.db.upsert_responses(id, &[response]).await?;
    state.db.record_activity(id, Utc::now()).await?;

    info!(
        checklist_id = %id,
        question_id = %query.question_id,
        durable = stored.durable,
        "Evidence attached"
    );
    Ok((StatusCode::CREATED, Json(stored)))
}

fn content_type_for(key: &str) -> &'static str {
    match key.rsplit('.').next().unwrap_or("") {
        "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Files that only made it to local disk.
async fn serve_evidence(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.evidence.local().read(&key).await {
        Ok(bytes) => Ok(([(header::CONTENT_TYPE, content_type_for(&key))], bytes)),
        Err(EvidenceError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ApiError::not_found("evidence", key))
        }
        Err(e) => Err(e.into()),
    }
}
