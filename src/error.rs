//! Error types for shiftcheck.

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Checklist error: {0}")]
    Checklist(#[from] ChecklistError),

    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    #[error("Duel error: {0}")]
    Duel(#[from] DuelError),

    #[error("Action plan error: {0}")]
    ActionPlan(#[from] ActionPlanError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Evidence error: {0}")]
    Evidence(#[from] EvidenceError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Template validation and execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ChecklistError {
    #[error("Template name is required")]
    MissingTitle,

    #[error("Template has no questions")]
    NoQuestions,

    #[error("Duplicate question id {0}")]
    DuplicateQuestion(Uuid),

    #[error("Question {question} has a rule targeting unknown question {target}")]
    UnknownRuleTarget { question: Uuid, target: Uuid },

    #[error("Unknown question {0}")]
    UnknownQuestion(Uuid),

    #[error("Checklist is incomplete: {} required question(s) unanswered", missing.len())]
    Incomplete { missing: Vec<Uuid> },

    #[error("Checklist {id} is already completed")]
    AlreadyCompleted { id: Uuid },

    #[error("Checklist {id} is still in progress")]
    NotCompleted { id: Uuid },

    #[error("Checklist {id} has {pending} action-plan draft(s) to handle before signing")]
    SignaturePending { id: Uuid, pending: usize },

    #[error("Checklist {id} is already signed")]
    AlreadySigned { id: Uuid },

    #[error("Checklist {id} has no pending action-plan draft")]
    NoPendingDraft { id: Uuid },

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
}

/// Conditional rule errors.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("Invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Duel lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum DuelError {
    #[error("A duel needs two different participants")]
    SameParticipant,

    #[error("Wager must be positive")]
    InvalidWager,

    #[error("Duel {id} is {state}, cannot {action}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        action: String,
    },

    #[error("User {user} is not part of duel {id}")]
    NotParticipant { id: Uuid, user: String },
}

/// Action plan lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum ActionPlanError {
    #[error("Action plan {id} cannot move from {from} to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Action plan title is required")]
    MissingTitle,
}

/// Notion sync errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Notion sync is not configured")]
    NotConfigured,

    #[error("Notion request failed: {0}")]
    Request(String),

    #[error("Notion API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Malformed Notion page {page_id}: {reason}")]
    MalformedPage { page_id: String, reason: String },

    #[error("Action plan {id} changed locally during sync")]
    Conflict { id: Uuid },

    #[error("Database error during sync: {0}")]
    Database(#[from] DatabaseError),
}

/// Evidence upload errors.
#[derive(Debug, thiserror::Error)]
pub enum EvidenceError {
    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
