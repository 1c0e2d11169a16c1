//! Action-plan draft queue shown after a run, before the signature step.

use std::collections::VecDeque;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// A pre-filled action plan for one flagged question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionPlanDraft {
    pub question_id: Uuid,
    pub title: String,
    pub problem: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence_urls: Vec<String>,
}

/// What happened to a draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DraftOutcome {
    Submitted { question_id: Uuid, plan_id: Uuid },
    Skipped { question_id: Uuid },
}

/// Drafts are worked through one at a time, in template order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionPlanQueue {
    pending: VecDeque<ActionPlanDraft>,
    outcomes: Vec<DraftOutcome>,
}

impl ActionPlanQueue {
    pub fn new(drafts: impl IntoIterator<Item = ActionPlanDraft>) -> Self {
        Self {
            pending: drafts.into_iter().collect(),
            outcomes: Vec::new(),
        }
    }

    /// The draft currently presented.
    pub fn current(&self) -> Option<&ActionPlanDraft> {
        self.pending.front()
    }

    pub fn pending(&self) -> impl Iterator<Item = &ActionPlanDraft> {
        self.pending.iter()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Record that the current draft was saved as plan `plan_id`.
    pub fn submit(&mut self, plan_id: Uuid) -> Option<ActionPlanDraft> {
        let draft = self.pending.pop_front()?;
        info!(question_id = %draft.question_id, plan_id = %plan_id, "Action plan draft submitted");
        self.outcomes.push(DraftOutcome::Submitted {
            question_id: draft.question_id,
            plan_id,
        });
        Some(draft)
    }

    /// Close the current draft without saving it.
    pub fn skip(&mut self) -> Option<ActionPlanDraft> {
        let draft = self.pending.pop_front()?;
        debug!(question_id = %draft.question_id, "Action plan draft skipped");
        self.outcomes.push(DraftOutcome::Skipped {
            question_id: draft.question_id,
        });
        Some(draft)
    }

    pub fn outcomes(&self) -> &[DraftOutcome] {
        &self.outcomes
    }

    /// Questions whose draft was skipped (no plan persisted).
    pub fn skipped(&self) -> Vec<Uuid> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                DraftOutcome::Skipped { question_id } => Some(*question_id),
                DraftOutcome::Submitted { .. } => None,
            })
            .collect()
    }

    pub fn ready_for_signature(&self) -> bool {
        self.pending.is_empty()
    }
}
