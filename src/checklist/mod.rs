//! Checklist engine.
//!
//! A run flows through:
//! 1. `RuleEvaluator` picks which questions are visible, which rules fired
//! 2. `ChecklistRun::complete()` applies the required-question gate, scoring
//! 3. `ActionPlanQueue` holds one draft per flagged question, before signature

pub mod model;
pub mod queue;
pub mod rules;
pub mod run;
pub mod schedule;
pub mod scoring;
pub mod timer;
pub mod versioning;

pub use model::{
    AnswerValue, Checklist, ChecklistResponse, ChecklistStatus, ChecklistTemplate, Difficulty,
    QuestionType, TemplateQuestion, TemplateSection,
};
pub use run::{ChecklistRun, Completion, RunEvaluation};
pub use timer::{ActivityTracker, TimerSummary};
