//! Unified `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::action_plans::{ActionPlan, ActionPlanStatus};
use crate::checklist::queue::ActionPlanQueue;
use crate::checklist::versioning::TemplateVersion;
use crate::checklist::{Checklist, ChecklistResponse, ChecklistTemplate};
use crate::error::DatabaseError;
use crate::gamification::{Duel, DuelStatus, Profile};

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Templates ───────────────────────────────────────────────────

    /// Insert the template row and its questions in one transaction.
    async fn insert_template(&self, template: &ChecklistTemplate) -> Result<(), DatabaseError>;

    /// Replace the template row and all of its questions in one transaction.
    async fn update_template(&self, template: &ChecklistTemplate) -> Result<(), DatabaseError>;

    async fn get_template(&self, id: Uuid) -> Result<Option<ChecklistTemplate>, DatabaseError>;

    async fn list_templates(&self) -> Result<Vec<ChecklistTemplate>, DatabaseError>;

    async fn insert_template_version(&self, version: &TemplateVersion) -> Result<(), DatabaseError>;

    /// Versions of a template, newest first.
    async fn list_template_versions(
        &self,
        template_id: Uuid,
    ) -> Result<Vec<TemplateVersion>, DatabaseError>;

    // ── Checklists ──────────────────────────────────────────────────

    async fn insert_checklist(&self, checklist: &Checklist) -> Result<(), DatabaseError>;

    async fn get_checklist(&self, id: Uuid) -> Result<Option<Checklist>, DatabaseError>;

    /// Record the signature of a completed, unsigned checklist. Returns false
    /// when it is not completed or already signed.
    async fn sign_checklist(&self, id: Uuid, signature: &str) -> Result<bool, DatabaseError>;

    /// Close an in-progress checklist: final responses, completed row and the
    /// action-plan draft queue, all or nothing. Returns false (and writes
    /// nothing) when the checklist was no longer in progress.
    async fn finish_checklist(
        &self,
        checklist: &Checklist,
        responses: &[ChecklistResponse],
        drafts: &ActionPlanQueue,
    ) -> Result<bool, DatabaseError>;

    /// Insert or replace responses keyed by question.
    async fn upsert_responses(
        &self,
        checklist_id: Uuid,
        responses: &[ChecklistResponse],
    ) -> Result<(), DatabaseError>;

    async fn get_responses(&self, checklist_id: Uuid) -> Result<Vec<ChecklistResponse>, DatabaseError>;

    /// Record a moment of user interaction (for the focus timer).
    async fn record_activity(&self, checklist_id: Uuid, at: DateTime<Utc>) -> Result<(), DatabaseError>;

    async fn get_activity(&self, checklist_id: Uuid) -> Result<Vec<DateTime<Utc>>, DatabaseError>;

    /// Draft queue stored when the checklist was finished.
    async fn get_draft_queue(&self, checklist_id: Uuid) -> Result<Option<ActionPlanQueue>, DatabaseError>;

    /// Store an advanced queue, plus the plan its submitted draft became, if
    /// the stored queue still holds `expected_pending` drafts.
    async fn advance_draft_queue(
        &self,
        checklist_id: Uuid,
        queue: &ActionPlanQueue,
        expected_pending: usize,
        plan: Option<&ActionPlan>,
    ) -> Result<bool, DatabaseError>;

    // ── Action plans ────────────────────────────────────────────────

    async fn insert_action_plan(&self, plan: &ActionPlan) -> Result<(), DatabaseError>;

    /// Write `plan` only if the stored row still has `expected_status`.
    /// Returns false when the plan is gone or another writer moved it.
    async fn update_action_plan(
        &self,
        plan: &ActionPlan,
        expected_status: ActionPlanStatus,
    ) -> Result<bool, DatabaseError>;

    async fn get_action_plan(&self, id: Uuid) -> Result<Option<ActionPlan>, DatabaseError>;

    /// Newest first, optionally filtered by status.
    async fn list_action_plans(
        &self,
        status: Option<ActionPlanStatus>,
    ) -> Result<Vec<ActionPlan>, DatabaseError>;

    async fn find_action_plan_by_notion_page(
        &self,
        page_id: &str,
    ) -> Result<Option<ActionPlan>, DatabaseError>;

    /// Plans that have no Notion page yet.
    async fn list_unsynced_action_plans(&self) -> Result<Vec<ActionPlan>, DatabaseError>;

    // ── Profiles ────────────────────────────────────────────────────

    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>, DatabaseError>;

    /// Add `delta` XP in place (floored at zero) and recompute the level.
    /// Creates the profile when missing.
    async fn add_xp(&self, user_id: &str, delta: i64) -> Result<Profile, DatabaseError>;

    /// Load (or create) a profile, apply `change` and store it with no other
    /// write in between.
    async fn modify_profile(
        &self,
        user_id: &str,
        change: &mut (dyn for<'p> FnMut(&'p mut Profile) + Send),
    ) -> Result<Profile, DatabaseError>;

    // ── Duels ───────────────────────────────────────────────────────

    async fn insert_duel(&self, duel: &Duel) -> Result<(), DatabaseError>;

    async fn get_duel(&self, id: Uuid) -> Result<Option<Duel>, DatabaseError>;

    /// Duels involving `user_id` (all duels when `None`), newest first.
    async fn list_duels(&self, user_id: Option<&str>) -> Result<Vec<Duel>, DatabaseError>;

    /// Active duels on `template_id` that `user_id` takes part in.
    async fn list_active_duels(
        &self,
        user_id: &str,
        template_id: Uuid,
    ) -> Result<Vec<Duel>, DatabaseError>;

    /// Write `duel` only if the stored row still has `expected_status` and
    /// `expected_updated_at`. Returns false when another writer got there first.
    async fn update_duel(
        &self,
        duel: &Duel,
        expected_status: DuelStatus,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;
}
