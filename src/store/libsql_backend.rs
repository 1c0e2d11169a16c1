//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Enum columns hold their serde
//! names, nested structures are stored as JSON text.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Transaction, params};
use rust_decimal::Decimal;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::action_plans::{ActionPlan, ActionPlanStatus};
use crate::checklist::model::{SectionMeta, TemplateQuestion};
use crate::checklist::queue::ActionPlanQueue;
use crate::checklist::versioning::{TemplateDiff, TemplateVersion};
use crate::checklist::{Checklist, ChecklistResponse, ChecklistStatus, ChecklistTemplate};
use crate::error::DatabaseError;
use crate::gamification::{Duel, DuelSide, DuelStatus, Profile, level_for_xp};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
///
/// Every write holds `write_gate`. Transactions run on the shared connection,
/// so a write from another task must not land inside one. Reads are not
/// gated and may see rows of a transaction that later rolls back.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_gate: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_gate: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn gate(&self) -> MutexGuard<'_, ()> {
        self.write_gate.lock().await
    }

    async fn begin(&self, op: &'static str) -> Result<Transaction, DatabaseError> {
        self.conn().transaction().await.map_err(query_err(op))
    }

    async fn load_questions(
        &self,
        template_id: Uuid,
    ) -> Result<Vec<(SectionMeta, TemplateQuestion)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {QUESTION_COLUMNS} FROM template_questions WHERE template_id = ?1 ORDER BY position"
                ),
                params![template_id.to_string()],
            )
            .await
            .map_err(query_err("load_questions"))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("load_questions"))? {
            out.push(row_to_question(&row)?);
        }
        Ok(out)
    }

    async fn assemble_template(&self, row: &libsql::Row) -> Result<ChecklistTemplate, DatabaseError> {
        let mut template = row_to_template(row)?;
        let rows = self.load_questions(template.id).await?;
        template.sections = ChecklistTemplate::sections_from_rows(rows);
        Ok(template)
    }

    async fn query_action_plans(
        &self,
        op: &'static str,
        filter: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<ActionPlan>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {PLAN_COLUMNS} FROM action_plans {filter}"),
                params,
            )
            .await
            .map_err(query_err(op))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err(op))? {
            out.push(row_to_plan(&row)?);
        }
        Ok(out)
    }

    async fn query_duels(
        &self,
        op: &'static str,
        filter: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Duel>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(&format!("SELECT {DUEL_COLUMNS} FROM duels {filter}"), params)
            .await
            .map_err(query_err(op))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err(op))? {
            out.push(row_to_duel(&row)?);
        }
        Ok(out)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Commit on success, roll back on error.
async fn settle<T>(
    tx: Transaction,
    op: &'static str,
    result: Result<T, DatabaseError>,
) -> Result<T, DatabaseError> {
    match result {
        Ok(value) => {
            tx.commit().await.map_err(query_err(op))?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(op, error = %rollback, "Rollback failed");
            }
            Err(e)
        }
    }
}

async fn insert_template_row(conn: &Connection, template: &ChecklistTemplate) -> Result<(), DatabaseError> {
    let schedule = template.schedule.as_ref().map(to_json).transpose()?;
    conn.execute(
        "INSERT INTO templates (id, title, icon, sector_id, difficulty, estimated_minutes, schedule, version, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            template.id.to_string(),
            template.title.as_str(),
            template.icon.as_deref(),
            template.sector_id.as_deref(),
            enum_to_str(&template.difficulty)?,
            i64::from(template.estimated_minutes),
            schedule,
            i64::from(template.version),
            template.created_at.to_rfc3339(),
            template.updated_at.to_rfc3339(),
        ],
    )
    .await
    .map_err(|e| match e.to_string() {
        msg if msg.contains("UNIQUE") => DatabaseError::Constraint(msg),
        msg => DatabaseError::Query(format!("insert_template: {msg}")),
    })?;
    Ok(())
}

async fn update_template_row(conn: &Connection, template: &ChecklistTemplate) -> Result<(), DatabaseError> {
    let schedule = template.schedule.as_ref().map(to_json).transpose()?;
    let changed = conn
        .execute(
            "UPDATE templates SET title = ?1, icon = ?2, sector_id = ?3, difficulty = ?4, estimated_minutes = ?5, schedule = ?6, version = ?7, updated_at = ?8
             WHERE id = ?9",
            params![
                template.title.as_str(),
                template.icon.as_deref(),
                template.sector_id.as_deref(),
                enum_to_str(&template.difficulty)?,
                i64::from(template.estimated_minutes),
                schedule,
                i64::from(template.version),
                template.updated_at.to_rfc3339(),
                template.id.to_string(),
            ],
        )
        .await
        .map_err(query_err("update_template"))?;
    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity: "template".into(),
            id: template.id.to_string(),
        });
    }
    Ok(())
}

async fn write_questions(conn: &Connection, template: &ChecklistTemplate) -> Result<(), DatabaseError> {
    conn.execute(
        "DELETE FROM template_questions WHERE template_id = ?1",
        params![template.id.to_string()],
    )
    .await
    .map_err(query_err("write_questions"))?;

    for (position, (meta, q)) in template.to_rows().into_iter().enumerate() {
        conn.execute(
            "INSERT INTO template_questions (id, template_id, position, section, text, question_type, required, weight, points, options, conditional_rules, media_instructions)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                q.id.to_string(),
                template.id.to_string(),
                position as i64,
                to_json(&meta)?,
                q.text.as_str(),
                enum_to_str(&q.question_type)?,
                q.required as i64,
                i64::from(q.effective_weight()),
                q.points.map(i64::from),
                to_json(&q.options)?,
                to_json(&q.conditional_rules)?,
                q.media_instructions.as_deref(),
            ],
        )
        .await
        .map_err(query_err("write_questions"))?;
    }
    Ok(())
}

async fn update_checklist_row(
    conn: &Connection,
    checklist: &Checklist,
    expected_status: ChecklistStatus,
) -> Result<bool, DatabaseError> {
    let changed = conn
        .execute(
            "UPDATE checklists SET status = ?1, score = ?2, conformity = ?3, signature = ?4, completed_at = ?5
             WHERE id = ?6 AND status = ?7",
            params![
                enum_to_str(&checklist.status)?,
                checklist.score.map(i64::from),
                checklist.conformity,
                checklist.signature.as_deref(),
                checklist.completed_at.map(|d| d.to_rfc3339()),
                checklist.id.to_string(),
                enum_to_str(&expected_status)?,
            ],
        )
        .await
        .map_err(query_err("update_checklist"))?;
    if changed == 0 {
        debug!(checklist_id = %checklist.id, "Checklist update lost a race");
    }
    Ok(changed > 0)
}

async fn upsert_response_rows(
    conn: &Connection,
    checklist_id: Uuid,
    responses: &[ChecklistResponse],
) -> Result<(), DatabaseError> {
    for r in responses {
        let value = r.value.as_ref().map(to_json).transpose()?;
        conn.execute(
            "INSERT INTO checklist_responses (checklist_id, question_id, value, photo_urls, comment, has_issue)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(checklist_id, question_id) DO UPDATE SET
                value = excluded.value,
                photo_urls = excluded.photo_urls,
                comment = excluded.comment,
                has_issue = excluded.has_issue",
            params![
                checklist_id.to_string(),
                r.question_id.to_string(),
                value,
                to_json(&r.photo_urls)?,
                r.comment.as_deref(),
                r.has_issue as i64,
            ],
        )
        .await
        .map_err(query_err("upsert_responses"))?;
    }
    Ok(())
}

async fn insert_plan_row(conn: &Connection, plan: &ActionPlan) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO action_plans ({PLAN_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
        ),
        params![
            plan.id.to_string(),
            plan.user_id.as_str(),
            plan.title.as_str(),
            plan.problem.as_str(),
            plan.due_date.map(|d| d.to_string()),
            plan.cost_type.as_str(),
            plan.estimated_cost.map(|c| c.to_string()),
            plan.status.as_str(),
            i64::from(plan.xp_reward),
            i64::from(plan.xp_awarded),
            to_json(&plan.evidence_urls)?,
            plan.checklist_id.map(|id| id.to_string()),
            plan.question_id.map(|id| id.to_string()),
            plan.notion_page_id.as_deref(),
            plan.created_at.to_rfc3339(),
            plan.updated_at.to_rfc3339(),
            plan.resolved_at.map(|d| d.to_rfc3339()),
        ],
    )
    .await
    .map_err(query_err("insert_action_plan"))?;
    Ok(())
}

async fn write_profile(conn: &Connection, profile: &Profile) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO profiles ({PROFILE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(user_id) DO UPDATE SET
                display_name = excluded.display_name,
                total_xp = excluded.total_xp,
                level = excluded.level,
                streak_days = excluded.streak_days,
                best_streak = excluded.best_streak,
                streak_shield_available = excluded.streak_shield_available,
                last_completion_date = excluded.last_completion_date,
                checklists_completed = excluded.checklists_completed,
                avatar_accessories = excluded.avatar_accessories,
                updated_at = excluded.updated_at"
        ),
        params![
            profile.user_id.as_str(),
            profile.display_name.as_deref(),
            profile.total_xp as i64,
            i64::from(profile.level),
            i64::from(profile.streak_days),
            i64::from(profile.best_streak),
            profile.streak_shield_available as i64,
            profile.last_completion_date.map(|d| d.to_string()),
            i64::from(profile.checklists_completed),
            profile.encode_accessories(),
            profile.updated_at.to_rfc3339(),
        ],
    )
    .await
    .map_err(query_err("write_profile"))?;
    Ok(())
}

fn query_err(op: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.filter(|s| !s.is_empty()).map(|s| parse_datetime(&s))
}

fn parse_optional_date(s: Option<String>) -> Option<NaiveDate> {
    s.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok())
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid '{s}': {e}")))
}

fn parse_optional_uuid(s: Option<String>) -> Option<Uuid> {
    s.and_then(|s| Uuid::parse_str(&s).ok())
}

/// Serde name of a unit enum variant, e.g. `QuestionType::YesNo` → `yes_no`.
fn enum_to_str<T: Serialize>(value: &T) -> Result<String, DatabaseError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(DatabaseError::Serialization(format!(
            "expected a string enum, got {other}"
        ))),
        Err(e) => Err(DatabaseError::Serialization(e.to_string())),
    }
}

fn str_to_enum<T: DeserializeOwned>(s: String) -> Result<T, DatabaseError> {
    serde_json::from_value(serde_json::Value::String(s))
        .map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json<T: DeserializeOwned>(s: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn text(row: &libsql::Row, idx: i32) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("column {idx}: {e}")))
}

fn int(row: &libsql::Row, idx: i32) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("column {idx}: {e}")))
}

const TEMPLATE_COLUMNS: &str =
    "id, title, icon, sector_id, difficulty, estimated_minutes, schedule, version, created_at, updated_at";

/// Template row without sections; see `assemble_template`.
fn row_to_template(row: &libsql::Row) -> Result<ChecklistTemplate, DatabaseError> {
    let schedule: Option<String> = row.get(6).ok();
    Ok(ChecklistTemplate {
        id: parse_uuid(&text(row, 0)?)?,
        title: text(row, 1)?,
        icon: row.get(2).ok(),
        sector_id: row.get(3).ok(),
        difficulty: str_to_enum(text(row, 4)?)?,
        estimated_minutes: int(row, 5)? as u32,
        schedule: schedule.map(|s| from_json(&s)).transpose()?,
        sections: Vec::new(),
        version: int(row, 7)? as u32,
        created_at: parse_datetime(&text(row, 8)?),
        updated_at: parse_datetime(&text(row, 9)?),
    })
}

const QUESTION_COLUMNS: &str = "id, section, text, question_type, required, weight, points, options, conditional_rules, media_instructions";

fn row_to_question(row: &libsql::Row) -> Result<(SectionMeta, TemplateQuestion), DatabaseError> {
    let meta: SectionMeta = from_json(&text(row, 1)?)?;
    let question = TemplateQuestion {
        id: parse_uuid(&text(row, 0)?)?,
        text: text(row, 2)?,
        question_type: str_to_enum(text(row, 3)?)?,
        required: int(row, 4)? != 0,
        weight: int(row, 5)?.clamp(0, i64::from(u8::MAX)) as u8,
        points: row.get::<i64>(6).ok().map(|p| p.max(0) as u32),
        options: from_json(&text(row, 7)?)?,
        conditional_rules: from_json(&text(row, 8)?)?,
        media_instructions: row.get(9).ok(),
    };
    Ok((meta, question))
}

const CHECKLIST_COLUMNS: &str = "id, template_id, user_id, sector_id, status, score, conformity, signature, started_at, completed_at";

fn row_to_checklist(row: &libsql::Row) -> Result<Checklist, DatabaseError> {
    Ok(Checklist {
        id: parse_uuid(&text(row, 0)?)?,
        template_id: parse_uuid(&text(row, 1)?)?,
        user_id: text(row, 2)?,
        sector_id: row.get(3).ok(),
        status: str_to_enum(text(row, 4)?)?,
        score: row.get::<i64>(5).ok().map(|s| s.max(0) as u32),
        conformity: row.get::<f64>(6).ok(),
        signature: row.get(7).ok(),
        started_at: parse_datetime(&text(row, 8)?),
        completed_at: parse_optional_datetime(row.get(9).ok()),
    })
}

fn row_to_response(row: &libsql::Row) -> Result<ChecklistResponse, DatabaseError> {
    let value: Option<String> = row.get(1).ok();
    Ok(ChecklistResponse {
        question_id: parse_uuid(&text(row, 0)?)?,
        value: value.map(|v| from_json(&v)).transpose()?,
        photo_urls: from_json(&text(row, 2)?)?,
        comment: row.get(3).ok(),
        has_issue: int(row, 4)? != 0,
    })
}

const PLAN_COLUMNS: &str = "id, user_id, title, problem, due_date, cost_type, estimated_cost, status, xp_reward, xp_awarded, evidence_urls, checklist_id, question_id, notion_page_id, created_at, updated_at, resolved_at";

fn row_to_plan(row: &libsql::Row) -> Result<ActionPlan, DatabaseError> {
    let estimated: Option<String> = row.get(6).ok();
    Ok(ActionPlan {
        id: parse_uuid(&text(row, 0)?)?,
        user_id: text(row, 1)?,
        title: text(row, 2)?,
        problem: text(row, 3)?,
        due_date: parse_optional_date(row.get(4).ok()),
        cost_type: str_to_enum(text(row, 5)?)?,
        estimated_cost: estimated
            .map(|s| {
                s.parse::<Decimal>()
                    .map_err(|e| DatabaseError::Serialization(format!("estimated_cost: {e}")))
            })
            .transpose()?,
        status: str_to_enum(text(row, 7)?)?,
        xp_reward: int(row, 8)?.max(0) as u32,
        xp_awarded: int(row, 9)?.max(0) as u32,
        evidence_urls: from_json(&text(row, 10)?)?,
        checklist_id: parse_optional_uuid(row.get(11).ok()),
        question_id: parse_optional_uuid(row.get(12).ok()),
        notion_page_id: row.get(13).ok(),
        created_at: parse_datetime(&text(row, 14)?),
        updated_at: parse_datetime(&text(row, 15)?),
        resolved_at: parse_optional_datetime(row.get(16).ok()),
    })
}

const PROFILE_COLUMNS: &str = "user_id, display_name, total_xp, level, streak_days, best_streak, streak_shield_available, last_completion_date, checklists_completed, avatar_accessories, updated_at";

fn row_to_profile(row: &libsql::Row) -> Result<Profile, DatabaseError> {
    Ok(Profile {
        user_id: text(row, 0)?,
        display_name: row.get(1).ok(),
        total_xp: int(row, 2)?.max(0) as u64,
        level: int(row, 3)?.max(1) as u32,
        streak_days: int(row, 4)?.max(0) as u32,
        best_streak: int(row, 5)?.max(0) as u32,
        streak_shield_available: int(row, 6)? != 0,
        last_completion_date: parse_optional_date(row.get(7).ok()),
        checklists_completed: int(row, 8)?.max(0) as u32,
        avatar_accessories: Profile::parse_accessories(&text(row, 9)?),
        updated_at: parse_datetime(&text(row, 10)?),
    })
}

const DUEL_COLUMNS: &str = "id, template_id, challenger_id, opponent_id, challenger_progress, opponent_progress, challenger_score, opponent_score, wager, status, winner, created_at, updated_at";

fn row_to_duel(row: &libsql::Row) -> Result<Duel, DatabaseError> {
    let status: String = text(row, 9)?;
    let status = DuelStatus::parse(&status)
        .ok_or_else(|| DatabaseError::Serialization(format!("unknown duel status '{status}'")))?;
    Ok(Duel {
        id: parse_uuid(&text(row, 0)?)?,
        template_id: parse_uuid(&text(row, 1)?)?,
        challenger: DuelSide {
            user_id: text(row, 2)?,
            progress: int(row, 4)?.clamp(0, 100) as u8,
            score: row.get::<i64>(6).ok().map(|s| s.max(0) as u32),
        },
        opponent: DuelSide {
            user_id: text(row, 3)?,
            progress: int(row, 5)?.clamp(0, 100) as u8,
            score: row.get::<i64>(7).ok().map(|s| s.max(0) as u32),
        },
        wager: int(row, 8)?.max(0) as u32,
        status,
        winner: row.get(10).ok(),
        created_at: parse_datetime(&text(row, 11)?),
        updated_at: parse_datetime(&text(row, 12)?),
    })
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Templates ───────────────────────────────────────────────────

    async fn insert_template(&self, template: &ChecklistTemplate) -> Result<(), DatabaseError> {
        let _gate = self.gate().await;
        let tx = self.begin("insert_template").await?;
        let result: Result<(), DatabaseError> = async {
            insert_template_row(&tx, template).await?;
            write_questions(&tx, template).await
        }
        .await;
        settle(tx, "insert_template", result).await?;
        debug!(template_id = %template.id, questions = template.question_count(), "Template inserted");
        Ok(())
    }

    async fn update_template(&self, template: &ChecklistTemplate) -> Result<(), DatabaseError> {
        let _gate = self.gate().await;
        let tx = self.begin("update_template").await?;
        let result: Result<(), DatabaseError> = async {
            update_template_row(&tx, template).await?;
            write_questions(&tx, template).await
        }
        .await;
        settle(tx, "update_template", result).await?;
        debug!(template_id = %template.id, version = template.version, "Template updated");
        Ok(())
    }

    async fn get_template(&self, id: Uuid) -> Result<Option<ChecklistTemplate>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TEMPLATE_COLUMNS} FROM templates WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_template"))?;

        match rows.next().await.map_err(query_err("get_template"))? {
            Some(row) => Ok(Some(self.assemble_template(&row).await?)),
            None => Ok(None),
        }
    }

    async fn list_templates(&self) -> Result<Vec<ChecklistTemplate>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TEMPLATE_COLUMNS} FROM templates ORDER BY title"),
                (),
            )
            .await
            .map_err(query_err("list_templates"))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_templates"))? {
            out.push(self.assemble_template(&row).await?);
        }
        Ok(out)
    }

    async fn insert_template_version(&self, version: &TemplateVersion) -> Result<(), DatabaseError> {
        let _gate = self.gate().await;
        self.conn()
            .execute(
                "INSERT INTO template_versions (template_id, version, added, removed, modified, snapshot, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    version.template_id.to_string(),
                    i64::from(version.version),
                    i64::from(version.diff.added),
                    i64::from(version.diff.removed),
                    i64::from(version.diff.modified),
                    to_json(&version.snapshot)?,
                    version.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err("insert_template_version"))?;
        Ok(())
    }

    async fn list_template_versions(
        &self,
        template_id: Uuid,
    ) -> Result<Vec<TemplateVersion>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT version, added, removed, modified, snapshot, created_at
                 FROM template_versions WHERE template_id = ?1 ORDER BY version DESC",
                params![template_id.to_string()],
            )
            .await
            .map_err(query_err("list_template_versions"))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_template_versions"))? {
            out.push(TemplateVersion {
                template_id,
                version: int(&row, 0)? as u32,
                diff: TemplateDiff {
                    added: int(&row, 1)? as u32,
                    removed: int(&row, 2)? as u32,
                    modified: int(&row, 3)? as u32,
                },
                snapshot: from_json(&text(&row, 4)?)?,
                created_at: parse_datetime(&text(&row, 5)?),
            });
        }
        Ok(out)
    }

    // ── Checklists ──────────────────────────────────────────────────

    async fn insert_checklist(&self, checklist: &Checklist) -> Result<(), DatabaseError> {
        let _gate = self.gate().await;
        self.conn()
            .execute(
                "INSERT INTO checklists (id, template_id, user_id, sector_id, status, score, conformity, signature, started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    checklist.id.to_string(),
                    checklist.template_id.to_string(),
                    checklist.user_id.as_str(),
                    checklist.sector_id.as_deref(),
                    enum_to_str(&checklist.status)?,
                    checklist.score.map(i64::from),
                    checklist.conformity,
                    checklist.signature.as_deref(),
                    checklist.started_at.to_rfc3339(),
                    checklist.completed_at.map(|d| d.to_rfc3339()),
                ],
            )
            .await
            .map_err(query_err("insert_checklist"))?;
        debug!(checklist_id = %checklist.id, user_id = %checklist.user_id, "Checklist started");
        Ok(())
    }

    async fn get_checklist(&self, id: Uuid) -> Result<Option<Checklist>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CHECKLIST_COLUMNS} FROM checklists WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_checklist"))?;

        match rows.next().await.map_err(query_err("get_checklist"))? {
            Some(row) => Ok(Some(row_to_checklist(&row)?)),
            None => Ok(None),
        }
    }

    async fn sign_checklist(&self, id: Uuid, signature: &str) -> Result<bool, DatabaseError> {
        let _gate = self.gate().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE checklists SET signature = ?1
                 WHERE id = ?2 AND status = ?3 AND signature IS NULL",
                params![signature, id.to_string(), enum_to_str(&ChecklistStatus::Completed)?],
            )
            .await
            .map_err(query_err("sign_checklist"))?;
        Ok(changed > 0)
    }

    async fn finish_checklist(
        &self,
        checklist: &Checklist,
        responses: &[ChecklistResponse],
        drafts: &ActionPlanQueue,
    ) -> Result<bool, DatabaseError> {
        let _gate = self.gate().await;
        let tx = self.begin("finish_checklist").await?;
        let result: Result<bool, DatabaseError> = async {
            if !update_checklist_row(&tx, checklist, ChecklistStatus::InProgress).await? {
                return Ok(false);
            }
            upsert_response_rows(&tx, checklist.id, responses).await?;
            tx.execute(
                "INSERT INTO draft_queues (checklist_id, queue, pending, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    checklist.id.to_string(),
                    to_json(drafts)?,
                    drafts.len() as i64,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err("finish_checklist"))?;
            Ok(true)
        }
        .await;
        let finished = settle(tx, "finish_checklist", result).await?;
        if finished {
            debug!(checklist_id = %checklist.id, drafts = drafts.len(), "Checklist finished");
        }
        Ok(finished)
    }

    async fn upsert_responses(
        &self,
        checklist_id: Uuid,
        responses: &[ChecklistResponse],
    ) -> Result<(), DatabaseError> {
        let _gate = self.gate().await;
        let tx = self.begin("upsert_responses").await?;
        let result = upsert_response_rows(&tx, checklist_id, responses).await;
        settle(tx, "upsert_responses", result).await?;
        debug!(checklist_id = %checklist_id, count = responses.len(), "Responses saved");
        Ok(())
    }

    async fn get_responses(&self, checklist_id: Uuid) -> Result<Vec<ChecklistResponse>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT question_id, value, photo_urls, comment, has_issue
                 FROM checklist_responses WHERE checklist_id = ?1 ORDER BY rowid",
                params![checklist_id.to_string()],
            )
            .await
            .map_err(query_err("get_responses"))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("get_responses"))? {
            out.push(row_to_response(&row)?);
        }
        Ok(out)
    }

    async fn record_activity(&self, checklist_id: Uuid, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        let _gate = self.gate().await;
        self.conn()
            .execute(
                "INSERT INTO checklist_activity (checklist_id, at) VALUES (?1, ?2)",
                params![checklist_id.to_string(), at.to_rfc3339()],
            )
            .await
            .map_err(query_err("record_activity"))?;
        Ok(())
    }

    async fn get_activity(&self, checklist_id: Uuid) -> Result<Vec<DateTime<Utc>>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT at FROM checklist_activity WHERE checklist_id = ?1 ORDER BY at",
                params![checklist_id.to_string()],
            )
            .await
            .map_err(query_err("get_activity"))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("get_activity"))? {
            out.push(parse_datetime(&text(&row, 0)?));
        }
        Ok(out)
    }

    async fn get_draft_queue(&self, checklist_id: Uuid) -> Result<Option<ActionPlanQueue>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT queue FROM draft_queues WHERE checklist_id = ?1",
                params![checklist_id.to_string()],
            )
            .await
            .map_err(query_err("get_draft_queue"))?;

        match rows.next().await.map_err(query_err("get_draft_queue"))? {
            Some(row) => Ok(Some(from_json(&text(&row, 0)?)?)),
            None => Ok(None),
        }
    }

    async fn advance_draft_queue(
        &self,
        checklist_id: Uuid,
        queue: &ActionPlanQueue,
        expected_pending: usize,
        plan: Option<&ActionPlan>,
    ) -> Result<bool, DatabaseError> {
        let _gate = self.gate().await;
        let tx = self.begin("advance_draft_queue").await?;
        let result: Result<bool, DatabaseError> = async {
            let changed = tx
                .execute(
                    "UPDATE draft_queues SET queue = ?1, pending = ?2, updated_at = ?3
                     WHERE checklist_id = ?4 AND pending = ?5",
                    params![
                        to_json(queue)?,
                        queue.len() as i64,
                        Utc::now().to_rfc3339(),
                        checklist_id.to_string(),
                        expected_pending as i64,
                    ],
                )
                .await
                .map_err(query_err("advance_draft_queue"))?;
            if changed == 0 {
                return Ok(false);
            }
            if let Some(plan) = plan {
                insert_plan_row(&tx, plan).await?;
            }
            Ok(true)
        }
        .await;
        let advanced = settle(tx, "advance_draft_queue", result).await?;
        if !advanced {
            debug!(checklist_id = %checklist_id, "Draft queue advance lost a race");
        }
        Ok(advanced)
    }

    // ── Action plans ────────────────────────────────────────────────

    async fn insert_action_plan(&self, plan: &ActionPlan) -> Result<(), DatabaseError> {
        let _gate = self.gate().await;
        insert_plan_row(self.conn(), plan).await?;
        debug!(plan_id = %plan.id, "Action plan inserted");
        Ok(())
    }

    async fn update_action_plan(
        &self,
        plan: &ActionPlan,
        expected_status: ActionPlanStatus,
    ) -> Result<bool, DatabaseError> {
        let _gate = self.gate().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE action_plans SET title = ?1, problem = ?2, due_date = ?3, cost_type = ?4, estimated_cost = ?5,
                    status = ?6, xp_reward = ?7, xp_awarded = ?8, evidence_urls = ?9, notion_page_id = ?10,
                    updated_at = ?11, resolved_at = ?12
                 WHERE id = ?13 AND status = ?14",
                params![
                    plan.title.as_str(),
                    plan.problem.as_str(),
                    plan.due_date.map(|d| d.to_string()),
                    plan.cost_type.as_str(),
                    plan.estimated_cost.map(|c| c.to_string()),
                    plan.status.as_str(),
                    i64::from(plan.xp_reward),
                    i64::from(plan.xp_awarded),
                    to_json(&plan.evidence_urls)?,
                    plan.notion_page_id.as_deref(),
                    plan.updated_at.to_rfc3339(),
                    plan.resolved_at.map(|d| d.to_rfc3339()),
                    plan.id.to_string(),
                    expected_status.as_str(),
                ],
            )
            .await
            .map_err(query_err("update_action_plan"))?;
        if changed == 0 {
            debug!(plan_id = %plan.id, "Action plan update lost a race");
        }
        Ok(changed > 0)
    }

    async fn get_action_plan(&self, id: Uuid) -> Result<Option<ActionPlan>, DatabaseError> {
        Ok(self
            .query_action_plans("get_action_plan", "WHERE id = ?1", params![id.to_string()])
            .await?
            .into_iter()
            .next())
    }

    async fn list_action_plans(
        &self,
        status: Option<ActionPlanStatus>,
    ) -> Result<Vec<ActionPlan>, DatabaseError> {
        match status {
            Some(status) => {
                self.query_action_plans(
                    "list_action_plans",
                    "WHERE status = ?1 ORDER BY created_at DESC",
                    params![status.as_str()],
                )
                .await
            }
            None => {
                self.query_action_plans("list_action_plans", "ORDER BY created_at DESC", ())
                    .await
            }
        }
    }

    async fn find_action_plan_by_notion_page(
        &self,
        page_id: &str,
    ) -> Result<Option<ActionPlan>, DatabaseError> {
        Ok(self
            .query_action_plans(
                "find_action_plan_by_notion_page",
                "WHERE notion_page_id = ?1",
                params![page_id],
            )
            .await?
            .into_iter()
            .next())
    }

    async fn list_unsynced_action_plans(&self) -> Result<Vec<ActionPlan>, DatabaseError> {
        self.query_action_plans(
            "list_unsynced_action_plans",
            "WHERE notion_page_id IS NULL ORDER BY created_at",
            (),
        )
        .await
    }

    // ── Profiles ────────────────────────────────────────────────────

    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE user_id = ?1"),
                params![user_id],
            )
            .await
            .map_err(query_err("get_profile"))?;

        match rows.next().await.map_err(query_err("get_profile"))? {
            Some(row) => Ok(Some(row_to_profile(&row)?)),
            None => Ok(None),
        }
    }

    async fn add_xp(&self, user_id: &str, delta: i64) -> Result<Profile, DatabaseError> {
        let _gate = self.gate().await;
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO profiles (user_id, total_xp, level, updated_at) VALUES (?1, MAX(?2, 0), 1, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET total_xp = MAX(total_xp + ?2, 0), updated_at = ?3",
                params![user_id, delta, now],
            )
            .await
            .map_err(query_err("add_xp"))?;

        let mut profile = self
            .get_profile(user_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "profile".into(),
                id: user_id.to_string(),
            })?;
        let level = level_for_xp(profile.total_xp);
        if level != profile.level {
            self.conn()
                .execute(
                    "UPDATE profiles SET level = ?1 WHERE user_id = ?2",
                    params![i64::from(level), user_id],
                )
                .await
                .map_err(query_err("add_xp"))?;
            if level > profile.level {
                info!(user_id = %user_id, level, "Level up");
            }
            profile.level = level;
        }
        Ok(profile)
    }

    async fn modify_profile(
        &self,
        user_id: &str,
        change: &mut (dyn for<'p> FnMut(&'p mut Profile) + Send),
    ) -> Result<Profile, DatabaseError> {
        let _gate = self.gate().await;
        let mut profile = self
            .get_profile(user_id)
            .await?
            .unwrap_or_else(|| Profile::new(user_id));
        change(&mut profile);
        write_profile(self.conn(), &profile).await?;
        Ok(profile)
    }

    // ── Duels ───────────────────────────────────────────────────────

    async fn insert_duel(&self, duel: &Duel) -> Result<(), DatabaseError> {
        let _gate = self.gate().await;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO duels ({DUEL_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    duel.id.to_string(),
                    duel.template_id.to_string(),
                    duel.challenger.user_id.as_str(),
                    duel.opponent.user_id.as_str(),
                    i64::from(duel.challenger.progress),
                    i64::from(duel.opponent.progress),
                    duel.challenger.score.map(i64::from),
                    duel.opponent.score.map(i64::from),
                    i64::from(duel.wager),
                    duel.status.as_str(),
                    duel.winner.as_deref(),
                    duel.created_at.to_rfc3339(),
                    duel.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err("insert_duel"))?;
        debug!(duel_id = %duel.id, "Duel inserted");
        Ok(())
    }

    async fn get_duel(&self, id: Uuid) -> Result<Option<Duel>, DatabaseError> {
        Ok(self
            .query_duels("get_duel", "WHERE id = ?1", params![id.to_string()])
            .await?
            .into_iter()
            .next())
    }

    async fn list_duels(&self, user_id: Option<&str>) -> Result<Vec<Duel>, DatabaseError> {
        match user_id {
            Some(user) => {
                self.query_duels(
                    "list_duels",
                    "WHERE challenger_id = ?1 OR opponent_id = ?1 ORDER BY created_at DESC",
                    params![user],
                )
                .await
            }
            None => {
                self.query_duels("list_duels", "ORDER BY created_at DESC", ())
                    .await
            }
        }
    }

    async fn list_active_duels(
        &self,
        user_id: &str,
        template_id: Uuid,
    ) -> Result<Vec<Duel>, DatabaseError> {
        self.query_duels(
            "list_active_duels",
            "WHERE status = 'active' AND template_id = ?1 AND (challenger_id = ?2 OR opponent_id = ?2)",
            params![template_id.to_string(), user_id],
        )
        .await
    }

    async fn update_duel(
        &self,
        duel: &Duel,
        expected_status: DuelStatus,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _gate = self.gate().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE duels SET challenger_progress = ?1, opponent_progress = ?2, challenger_score = ?3,
                    opponent_score = ?4, status = ?5, winner = ?6, updated_at = ?7
                 WHERE id = ?8 AND status = ?9 AND updated_at = ?10",
                params![
                    i64::from(duel.challenger.progress),
                    i64::from(duel.opponent.progress),
                    duel.challenger.score.map(i64::from),
                    duel.opponent.score.map(i64::from),
                    duel.status.as_str(),
                    duel.winner.as_deref(),
                    duel.updated_at.to_rfc3339(),
                    duel.id.to_string(),
                    expected_status.as_str(),
                    expected_updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err("update_duel"))?;
        if changed == 0 {
            debug!(duel_id = %duel.id, "Duel update lost a race");
        }
        Ok(changed > 0)
    }
}
