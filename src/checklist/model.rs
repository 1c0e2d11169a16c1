//! Checklist data model: templates, sections, questions, rules, answers.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::schedule::ScheduleConfig;
use crate::error::ChecklistError;

/// Default points-per-weight when a question carries no explicit points.
pub const POINTS_PER_WEIGHT: u32 = 10;

/// Allowed question weight range (conformity multiplier).
pub const MIN_WEIGHT: u8 = 1;
pub const MAX_WEIGHT: u8 = 5;

/// Kind of answer a question expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    YesNo,
    Rating,
    Number,
    Text,
    Options,
    Photo,
    Signature,
    Temperature,
}

/// Template difficulty, scales the final score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    #[default]
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn multiplier(self) -> f64 {
        match self {
            Self::Easy => 1.0,
            Self::Medium => 1.2,
            Self::Hard => 1.5,
        }
    }
}

/// Comparison used by a rule condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
    IsEmpty,
    IsNotEmpty,
    /// Regular expression match.
    Matches,
}

/// What a matching rule does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    /// Reveal the listed questions.
    ShowQuestions { question_ids: Vec<Uuid> },
    /// The answered question must carry at least one photo.
    RequirePhoto,
    /// Queue an action-plan draft for this non-conformity.
    CreateActionPlan {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        due_in_days: Option<u32>,
    },
    /// Flag the response for a supervisor.
    NotifySupervisor {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl RuleAction {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ShowQuestions { .. } => "show_questions",
            Self::RequirePhoto => "require_photo",
            Self::CreateActionPlan { .. } => "create_action_plan",
            Self::NotifySupervisor { .. } => "notify_supervisor",
        }
    }
}

/// An additional AND-ed condition on a rule.
///
/// `question_id` points at another question's answer; `None` means the
/// question that owns the rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_id: Option<Uuid>,
    pub operator: RuleOperator,
    #[serde(default)]
    pub value: String,
}

/// Trigger condition → action mapping attached to a question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalRule {
    pub operator: RuleOperator,
    #[serde(default)]
    pub value: String,
    pub action: RuleAction,
    /// Checked only after the parent condition matched.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nested: Vec<RuleCondition>,
}

impl ConditionalRule {
    pub fn new(operator: RuleOperator, value: impl Into<String>, action: RuleAction) -> Self {
        Self {
            operator,
            value: value.into(),
            action,
            nested: Vec::new(),
        }
    }

    /// Builder: add a nested AND condition.
    pub fn and(mut self, condition: RuleCondition) -> Self {
        self.nested.push(condition);
        self
    }
}

/// A single question in a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateQuestion {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub text: String,
    pub question_type: QuestionType,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_weight")]
    pub weight: u8,
    /// Explicit points; defaults to `weight * POINTS_PER_WEIGHT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditional_rules: Vec<ConditionalRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_instructions: Option<String>,
}

fn default_weight() -> u8 {
    MIN_WEIGHT
}

impl TemplateQuestion {
    pub fn new(text: impl Into<String>, question_type: QuestionType) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            question_type,
            required: false,
            weight: MIN_WEIGHT,
            points: None,
            options: Vec::new(),
            conditional_rules: Vec::new(),
            media_instructions: None,
        }
    }

    /// Builder: mark as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Builder: set weight.
    pub fn with_weight(mut self, weight: u8) -> Self {
        self.weight = weight;
        self
    }

    /// Builder: set explicit points.
    pub fn with_points(mut self, points: u32) -> Self {
        self.points = Some(points);
        self
    }

    /// Builder: set selectable options.
    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: attach a conditional rule.
    pub fn with_rule(mut self, rule: ConditionalRule) -> Self {
        self.conditional_rules.push(rule);
        self
    }

    /// Weight clamped into the allowed range.
    pub fn effective_weight(&self) -> u8 {
        self.weight.clamp(MIN_WEIGHT, MAX_WEIGHT)
    }

    pub fn effective_points(&self) -> u32 {
        self.points
            .unwrap_or(self.effective_weight() as u32 * POINTS_PER_WEIGHT)
    }
}

/// Section metadata as stored alongside each question row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionMeta {
    pub id: Uuid,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub position: u32,
}

/// A titled group of questions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSection {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub questions: Vec<TemplateQuestion>,
}

impl TemplateSection {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: None,
            questions: Vec::new(),
        }
    }

    /// Builder: append a question.
    pub fn with_question(mut self, question: TemplateQuestion) -> Self {
        self.questions.push(question);
        self
    }

    pub fn meta(&self, position: u32) -> SectionMeta {
        SectionMeta {
            id: self.id,
            title: self.title.clone(),
            description: self.description.clone(),
            position,
        }
    }
}

/// Reusable checklist definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistTemplate {
    pub id: Uuid,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector_id: Option<String>,
    #[serde(default)]
    pub difficulty: Difficulty,
    pub estimated_minutes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleConfig>,
    pub sections: Vec<TemplateSection>,
    #[serde(default)]
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChecklistTemplate {
    pub fn new(title: impl Into<String>, estimated_minutes: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            icon: None,
            sector_id: None,
            difficulty: Difficulty::Easy,
            estimated_minutes,
            schedule: None,
            sections: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set difficulty.
    pub fn with_difficulty(mut self, difficulty: Difficulty) -> Self {
        self.difficulty = difficulty;
        self
    }

    /// Builder: append a section.
    pub fn with_section(mut self, section: TemplateSection) -> Self {
        self.sections.push(section);
        self
    }

    /// Builder: set the schedule.
    pub fn with_schedule(mut self, schedule: ScheduleConfig) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// All questions, in section then position order.
    pub fn questions(&self) -> impl Iterator<Item = &TemplateQuestion> {
        self.sections.iter().flat_map(|s| s.questions.iter())
    }

    pub fn question(&self, id: Uuid) -> Option<&TemplateQuestion> {
        self.questions().find(|q| q.id == id)
    }

    pub fn question_count(&self) -> usize {
        self.sections.iter().map(|s| s.questions.len()).sum()
    }

    /// Basic save-time validation.
    pub fn validate(&self) -> Result<(), ChecklistError> {
        if self.title.trim().is_empty() {
            return Err(ChecklistError::MissingTitle);
        }
        if self.question_count() == 0 {
            return Err(ChecklistError::NoQuestions);
        }

        let mut seen = HashSet::new();
        for q in self.questions() {
            if !seen.insert(q.id) {
                return Err(ChecklistError::DuplicateQuestion(q.id));
            }
        }

        for q in self.questions() {
            for rule in &q.conditional_rules {
                if let RuleAction::ShowQuestions { question_ids } = &rule.action {
                    if let Some(target) = question_ids.iter().find(|t| !seen.contains(*t)) {
                        return Err(ChecklistError::UnknownRuleTarget {
                            question: q.id,
                            target: *target,
                        });
                    }
                }
                for cond in &rule.nested {
                    if let Some(other) = cond.question_id.filter(|id| !seen.contains(id)) {
                        return Err(ChecklistError::UnknownRuleTarget {
                            question: q.id,
                            target: other,
                        });
                    }
                }
            }
        }

        if let Some(schedule) = &self.schedule {
            schedule.validate()?;
        }
        Ok(())
    }

    /// Flatten into `(section meta, question)` rows, the persisted layout.
    pub fn to_rows(&self) -> Vec<(SectionMeta, &TemplateQuestion)> {
        self.sections
            .iter()
            .enumerate()
            .flat_map(|(i, s)| {
                let meta = s.meta(i as u32);
                s.questions.iter().map(move |q| (meta.clone(), q))
            })
            .collect()
    }

    /// Regroup persisted rows into sections, ordered by section position.
    /// Rows must already be in question order.
    pub fn sections_from_rows(rows: Vec<(SectionMeta, TemplateQuestion)>) -> Vec<TemplateSection> {
        let mut grouped: Vec<(SectionMeta, Vec<TemplateQuestion>)> = Vec::new();
        for (meta, question) in rows {
            match grouped.iter_mut().find(|(m, _)| m.id == meta.id) {
                Some((_, questions)) => questions.push(question),
                None => grouped.push((meta, vec![question])),
            }
        }
        grouped.sort_by_key(|(m, _)| m.position);
        grouped
            .into_iter()
            .map(|(meta, questions)| TemplateSection {
                id: meta.id,
                title: meta.title,
                description: meta.description,
                questions,
            })
            .collect()
    }
}

/// A respondent's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerValue {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<String>),
}

impl AnswerValue {
    /// Canonical string form used by rule comparison.
    pub fn stringify(&self) -> String {
        match self {
            Self::Bool(true) => "yes".to_string(),
            Self::Bool(false) => "no".to_string(),
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s.clone(),
            Self::List(items) => items.join(","),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Bool(_) => false,
            Self::Number(n) => n.is_nan(),
            Self::Text(s) => s.trim().is_empty(),
            Self::List(items) => items.iter().all(|i| i.trim().is_empty()),
        }
    }

    /// Interpret as yes/no. Text accepts "yes"/"true"/"sim" and the negatives.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Text(s) => match s.trim().to_lowercase().as_str() {
                "yes" | "true" | "sim" | "y" => Some(true),
                "no" | "false" | "nao" | "não" | "n" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) if n.is_finite() => Some(*n),
            Self::Text(s) => s.trim().replace(',', ".").parse().ok(),
            _ => None,
        }
    }
}

/// One persisted answer within a checklist run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistResponse {
    pub question_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<AnswerValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub photo_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default)]
    pub has_issue: bool,
}

impl ChecklistResponse {
    pub fn new(question_id: Uuid) -> Self {
        Self {
            question_id,
            value: None,
            photo_urls: Vec::new(),
            comment: None,
            has_issue: false,
        }
    }

    pub fn is_answered(&self) -> bool {
        self.value.as_ref().is_some_and(|v| !v.is_empty())
    }
}

/// Lifecycle status of a checklist execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecklistStatus {
    InProgress,
    Completed,
}

/// One run of a template by one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checklist {
    pub id: Uuid,
    pub template_id: Uuid,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector_id: Option<String>,
    pub status: ChecklistStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conformity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Checklist {
    pub fn start(template: &ChecklistTemplate, user_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            template_id: template.id,
            user_id: user_id.into(),
            sector_id: template.sector_id.clone(),
            status: ChecklistStatus::InProgress,
            score: None,
            conformity: None,
            signature: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_template() -> ChecklistTemplate {
        ChecklistTemplate::new("Closing", 15)
            .with_section(
                TemplateSection::new("Kitchen")
                    .with_question(TemplateQuestion::new("Fryer off?", QuestionType::YesNo))
                    .with_question(TemplateQuestion::new("Fridge temp", QuestionType::Temperature)),
            )
            .with_section(
                TemplateSection::new("Dining")
                    .with_question(TemplateQuestion::new("Floor mopped?", QuestionType::YesNo)),
            )
    }

    #[test]
    fn difficulty_multipliers() {
        assert_eq!(Difficulty::Easy.multiplier(), 1.0);
        assert_eq!(Difficulty::Medium.multiplier(), 1.2);
        assert_eq!(Difficulty::Hard.multiplier(), 1.5);
    }

    #[test]
    fn effective_points_defaults_to_weight() {
        let q = TemplateQuestion::new("x", QuestionType::YesNo).with_weight(3);
        assert_eq!(q.effective_points(), 30);
        let q = q.with_points(100);
        assert_eq!(q.effective_points(), 100);
    }

    #[test]
    fn weight_is_clamped() {
        assert_eq!(TemplateQuestion::new("x", QuestionType::YesNo).with_weight(0).effective_weight(), 1);
        assert_eq!(TemplateQuestion::new("x", QuestionType::YesNo).with_weight(9).effective_weight(), 5);
    }

    #[test]
    fn validate_requires_title_and_questions() {
        let mut t = ChecklistTemplate::new("  ", 5);
        assert!(matches!(t.validate(), Err(ChecklistError::MissingTitle)));
        t.title = "Opening".into();
        assert!(matches!(t.validate(), Err(ChecklistError::NoQuestions)));
        assert!(sample_template().validate().is_ok());
    }

    #[test]
    fn validate_rejects_unknown_rule_target() {
        let ghost = Uuid::new_v4();
        let t = ChecklistTemplate::new("Opening", 5).with_section(
            TemplateSection::new("S").with_question(
                TemplateQuestion::new("q", QuestionType::YesNo).with_rule(ConditionalRule::new(
                    RuleOperator::Equals,
                    "no",
                    RuleAction::ShowQuestions {
                        question_ids: vec![ghost],
                    },
                )),
            ),
        );
        match t.validate() {
            Err(ChecklistError::UnknownRuleTarget { target, .. }) => assert_eq!(target, ghost),
            other => panic!("Expected UnknownRuleTarget, got {:?}", other),
        }
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let q = TemplateQuestion::new("q", QuestionType::YesNo);
        let t = ChecklistTemplate::new("Dup", 5)
            .with_section(TemplateSection::new("S").with_question(q.clone()).with_question(q));
        assert!(matches!(t.validate(), Err(ChecklistError::DuplicateQuestion(_))));
    }

    #[test]
    fn rows_roundtrip_preserves_section_order() {
        let t = sample_template();
        let rows: Vec<(SectionMeta, TemplateQuestion)> = t
            .to_rows()
            .into_iter()
            .map(|(m, q)| (m, q.clone()))
            .collect();
        assert_eq!(rows.len(), 3);
        let sections = ChecklistTemplate::sections_from_rows(rows);
        assert_eq!(sections, t.sections);
    }

    #[test]
    fn answer_stringify() {
        assert_eq!(AnswerValue::Bool(true).stringify(), "yes");
        assert_eq!(AnswerValue::Bool(false).stringify(), "no");
        assert_eq!(AnswerValue::Number(4.0).stringify(), "4");
        assert_eq!(AnswerValue::Number(3.5).stringify(), "3.5");
        assert_eq!(AnswerValue::Number(1e19).stringify(), "10000000000000000000");
        assert_eq!(
            AnswerValue::List(vec!["a".into(), "b".into()]).stringify(),
            "a,b"
        );
    }

    #[test]
    fn answer_untagged_deserialization() {
        let v: AnswerValue = serde_json::from_str("true").unwrap();
        assert_eq!(v, AnswerValue::Bool(true));
        let v: AnswerValue = serde_json::from_str("4").unwrap();
        assert_eq!(v, AnswerValue::Number(4.0));
        let v: AnswerValue = serde_json::from_str("\"ok\"").unwrap();
        assert_eq!(v, AnswerValue::Text("ok".into()));
        let v: AnswerValue = serde_json::from_str("[\"a\"]").unwrap();
        assert_eq!(v, AnswerValue::List(vec!["a".into()]));
    }

    #[test]
    fn answer_emptiness() {
        assert!(AnswerValue::Text("   ".into()).is_empty());
        assert!(AnswerValue::List(vec![]).is_empty());
        assert!(!AnswerValue::Bool(false).is_empty());
        assert!(!AnswerValue::Number(0.0).is_empty());
    }

    #[test]
    fn rule_action_serialization() {
        let action = RuleAction::CreateActionPlan {
            title: Some("Fix fridge".into()),
            due_in_days: None,
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "create_action_plan");
        assert_eq!(json["title"], "Fix fridge");
        assert!(json.get("due_in_days").is_none());
    }
}
