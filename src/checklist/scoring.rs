//! Checklist scoring: base points, time bonuses, difficulty multiplier.
//!
//! All arithmetic is done in integer per-mille so that the published
//! `floor(...)` results hold exactly (no `161.99999` surprises).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::model::{AnswerValue, ChecklistTemplate, QuestionType};
use super::rules::Answers;
use super::timer::TimerSummary;
use crate::config::ScoringConfig;

/// Ratings at or above this value count as conforming.
pub const RATING_CONFORMING_MIN: f64 = 3.0;

/// How a final score was put together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub base: u32,
    pub speed_bonus: u32,
    pub focus_bonus: u32,
    pub multiplier: f64,
    pub total: u32,
    /// Weighted share of conforming answers, 0–100. `None` if nothing assessable was answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conformity: Option<f64>,
}

/// Whether an answer earns the question's points.
pub fn counts_as_positive(question_type: QuestionType, value: &AnswerValue) -> bool {
    match question_type {
        QuestionType::YesNo => value.as_bool() == Some(true),
        _ => !value.is_empty(),
    }
}

/// Whether an answer is a conformity, for the question types that have one.
fn conformity_of(question_type: QuestionType, value: &AnswerValue) -> Option<bool> {
    match question_type {
        QuestionType::YesNo => value.as_bool(),
        QuestionType::Rating => value.as_number().map(|n| n >= RATING_CONFORMING_MIN),
        _ => None,
    }
}

fn per_mille(ratio: f64) -> u64 {
    (ratio * 1000.0).round().max(0.0) as u64
}

fn apply(amount: u64, per_mille: u64) -> u64 {
    amount.saturating_mul(per_mille) / 1000
}

/// Sum of points over visible, positively answered questions.
///
/// Photo questions are answered by their attachments, so they count when
/// `photographed` holds them, whatever their `value`.
pub fn base_score(
    template: &ChecklistTemplate,
    answers: &Answers,
    photographed: &HashSet<Uuid>,
    visible: &HashSet<Uuid>,
) -> u32 {
    template
        .questions()
        .filter(|q| visible.contains(&q.id))
        .filter(|q| match q.question_type {
            QuestionType::Photo => photographed.contains(&q.id),
            other => answers.get(&q.id).is_some_and(|v| counts_as_positive(other, v)),
        })
        .map(|q| q.effective_points())
        .sum()
}

/// Weighted conformity percentage over answered yes/no and rating questions.
pub fn conformity(template: &ChecklistTemplate, answers: &Answers, visible: &HashSet<Uuid>) -> Option<f64> {
    let mut total_weight = 0u32;
    let mut conforming_weight = 0u32;
    for q in template.questions().filter(|q| visible.contains(&q.id)) {
        let Some(ok) = answers.get(&q.id).and_then(|v| conformity_of(q.question_type, v)) else {
            continue;
        };
        let weight = u32::from(q.effective_weight());
        total_weight += weight;
        if ok {
            conforming_weight += weight;
        }
    }
    if total_weight == 0 {
        return None;
    }
    let pct = f64::from(conforming_weight) * 100.0 / f64::from(total_weight);
    Some((pct * 100.0).round() / 100.0)
}

/// Full score for a run.
pub fn score(
    template: &ChecklistTemplate,
    answers: &Answers,
    photographed: &HashSet<Uuid>,
    visible: &HashSet<Uuid>,
    timing: &TimerSummary,
    config: &ScoringConfig,
) -> ScoreBreakdown {
    let base = base_score(template, answers, photographed, visible);
    let base64 = u64::from(base);

    let speed_bonus = if timing.within_estimate(template.estimated_minutes) {
        apply(base64, per_mille(config.speed_bonus_ratio))
    } else {
        0
    };
    let focus_bonus = if timing.focused(config.idle_threshold.as_secs()) {
        apply(base64, per_mille(config.focus_bonus_ratio))
    } else {
        0
    };

    let multiplier = template.difficulty.multiplier();
    let total = apply(
        base64.saturating_add(speed_bonus).saturating_add(focus_bonus),
        per_mille(multiplier),
    );

    ScoreBreakdown {
        base,
        speed_bonus: u32::try_from(speed_bonus).unwrap_or(u32::MAX),
        focus_bonus: u32::try_from(focus_bonus).unwrap_or(u32::MAX),
        multiplier,
        total: u32::try_from(total).unwrap_or(u32::MAX),
        conformity: conformity(template, answers, visible),
    }
}
