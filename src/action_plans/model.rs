//! Action plan data model and status lifecycle.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::checklist::queue::ActionPlanDraft;
use crate::error::ActionPlanError;

/// XP granted when a plan is resolved, unless overridden.
pub const DEFAULT_RESOLUTION_XP: u32 = 50;

/// Rough cost bucket for the remediation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostType {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl CostType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Lenient parse, used for remote select values ("High", " low ").
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Some(Self::None),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionPlanStatus {
    #[default]
    Pending,
    InProgress,
    Resolved,
    Canceled,
}

impl ActionPlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Resolved => "resolved",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "resolved" => Some(Self::Resolved),
            "canceled" | "cancelled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Canceled)
    }

    pub fn can_transition_to(&self, next: ActionPlanStatus) -> bool {
        use ActionPlanStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress) | (InProgress, Resolved) | (Pending | InProgress, Canceled)
        )
    }
}

impl std::fmt::Display for ActionPlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remediation task for a non-conformity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionPlan {
    /// Unique ID, also written onto the Notion page.
    pub id: Uuid,
    /// User who owns the plan and receives the resolution XP.
    pub user_id: String,
    pub title: String,
    /// Free-text problem description.
    #[serde(default)]
    pub problem: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub cost_type: CostType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<Decimal>,
    #[serde(default)]
    pub status: ActionPlanStatus,
    /// XP granted on resolution.
    pub xp_reward: u32,
    /// XP actually granted so far (0 until resolved).
    #[serde(default)]
    pub xp_awarded: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence_urls: Vec<String>,
    /// Execution that raised the plan, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checklist_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_id: Option<Uuid>,
    /// Remote page this plan is mirrored to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notion_page_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ActionPlan {
    pub fn new(user_id: impl Into<String>, title: impl Into<String>) -> Result<Self, ActionPlanError> {
        let title = title.into();
        if title.trim().is_empty() {
            return Err(ActionPlanError::MissingTitle);
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            title,
            problem: String::new(),
            due_date: None,
            cost_type: CostType::None,
            estimated_cost: None,
            status: ActionPlanStatus::Pending,
            xp_reward: DEFAULT_RESOLUTION_XP,
            xp_awarded: 0,
            evidence_urls: Vec::new(),
            checklist_id: None,
            question_id: None,
            notion_page_id: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        })
    }

    /// Turn a queued draft into a plan owned by `user_id`.
    pub fn from_draft(
        draft: &ActionPlanDraft,
        user_id: impl Into<String>,
        checklist_id: Uuid,
    ) -> Result<Self, ActionPlanError> {
        let mut plan = Self::new(user_id, draft.title.clone())?;
        plan.problem = draft.problem.clone();
        plan.due_date = draft.due_date;
        plan.evidence_urls = draft.evidence_urls.clone();
        plan.checklist_id = Some(checklist_id);
        plan.question_id = Some(draft.question_id);
        Ok(plan)
    }

    pub fn with_problem(mut self, problem: impl Into<String>) -> Self {
        self.problem = problem.into();
        self
    }

    pub fn with_due_date(mut self, due: NaiveDate) -> Self {
        self.due_date = Some(due);
        self
    }

    pub fn with_cost(mut self, cost_type: CostType, estimated: Option<Decimal>) -> Self {
        self.cost_type = cost_type;
        self.estimated_cost = estimated;
        self
    }

    pub fn with_xp_reward(mut self, xp: u32) -> Self {
        self.xp_reward = xp;
        self
    }

    /// Move to `next`. Returns the XP earned by this transition.
    pub fn transition(&mut self, next: ActionPlanStatus) -> Result<u32, ActionPlanError> {
        if !self.status.can_transition_to(next) {
            return Err(ActionPlanError::InvalidTransition {
                id: self.id,
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        self.status = next;
        self.updated_at = now;

        let earned = if next == ActionPlanStatus::Resolved {
            self.resolved_at = Some(now);
            self.xp_awarded = self.xp_reward;
            self.xp_reward
        } else {
            0
        };
        info!(plan_id = %self.id, status = %next, xp = earned, "Action plan status changed");
        Ok(earned)
    }

    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        !self.status.is_terminal() && self.due_date.is_some_and(|d| d < today)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn plan() -> ActionPlan {
        ActionPlan::new("ana", "Replace fridge seal").unwrap()
    }

    #[test]
    fn empty_title_rejected() {
        assert!(matches!(
            ActionPlan::new("ana", "  "),
            Err(ActionPlanError::MissingTitle)
        ));
    }

    #[test]
    fn from_draft_copies_fields() {
        let draft = ActionPlanDraft {
            question_id: Uuid::new_v4(),
            title: "Fix: Fridge below 5C?".into(),
            problem: "Fridge below 5C?: no - 9 degrees".into(),
            due_date: NaiveDate::from_ymd_opt(2026, 7, 10),
            evidence_urls: vec!["https://x/1.jpg".into()],
        };
        let checklist = Uuid::new_v4();
        let p = ActionPlan::from_draft(&draft, "ana", checklist).unwrap();
        assert_eq!(p.title, draft.title);
        assert_eq!(p.problem, draft.problem);
        assert_eq!(p.due_date, draft.due_date);
        assert_eq!(p.question_id, Some(draft.question_id));
        assert_eq!(p.checklist_id, Some(checklist));
        assert_eq!(p.status, ActionPlanStatus::Pending);
    }

    #[test]
    fn resolution_awards_xp_once() {
        let mut p = plan().with_xp_reward(80);
        assert_eq!(p.transition(ActionPlanStatus::InProgress).unwrap(), 0);
        assert_eq!(p.transition(ActionPlanStatus::Resolved).unwrap(), 80);
        assert_eq!(p.xp_awarded, 80);
        assert!(p.resolved_at.is_some());
        assert!(p.transition(ActionPlanStatus::Resolved).is_err());
        assert!(p.transition(ActionPlanStatus::Canceled).is_err());
    }

    #[test]
    fn cannot_skip_in_progress() {
        let mut p = plan();
        assert!(matches!(
            p.transition(ActionPlanStatus::Resolved),
            Err(ActionPlanError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn cancel_from_pending_or_in_progress() {
        let mut p = plan();
        assert_eq!(p.transition(ActionPlanStatus::Canceled).unwrap(), 0);
        assert!(p.transition(ActionPlanStatus::InProgress).is_err());

        let mut q = plan();
        q.transition(ActionPlanStatus::InProgress).unwrap();
        q.transition(ActionPlanStatus::Canceled).unwrap();
        assert_eq!(q.xp_awarded, 0);
    }

    #[test]
    fn lenient_status_and_cost_parsing() {
        assert_eq!(ActionPlanStatus::parse("In progress"), Some(ActionPlanStatus::InProgress));
        assert_eq!(ActionPlanStatus::parse("cancelled"), Some(ActionPlanStatus::Canceled));
        assert_eq!(CostType::parse(" High "), Some(CostType::High));
        assert_eq!(CostType::parse("huge"), None);
    }

    #[test]
    fn estimated_cost_serializes_as_string() {
        let p = plan().with_cost(CostType::Medium, Some(dec!(149.90)));
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["estimated_cost"], "149.90");
        assert_eq!(json["cost_type"], "medium");
    }

    #[test]
    fn overdue_only_when_open() {
        let today = NaiveDate::from_ymd_opt(2026, 7, 10).unwrap();
        let mut p = plan().with_due_date(NaiveDate::from_ymd_opt(2026, 7, 9).unwrap());
        assert!(p.is_overdue(today));
        p.transition(ActionPlanStatus::Canceled).unwrap();
        assert!(!p.is_overdue(today));
    }
}
