//! Checklist execution: answers in, evaluation and completion out.

use std::collections::{HashMap, HashSet};

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::model::{
    AnswerValue, ChecklistResponse, ChecklistTemplate, QuestionType, RuleAction, TemplateQuestion,
};
use super::queue::{ActionPlanDraft, ActionPlanQueue};
use super::rules::{Answers, RuleEvaluator, TriggeredAction};
use super::scoring::{self, ScoreBreakdown};
use super::timer::TimerSummary;
use crate::config::ScoringConfig;
use crate::error::{ChecklistError, RuleError};

/// Snapshot of rule effects for the current answers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunEvaluation {
    /// Visible questions, in template order.
    pub visible: Vec<Uuid>,
    pub missing_required: Vec<Uuid>,
    pub photo_required: Vec<Uuid>,
    pub triggered: Vec<TriggeredAction>,
    /// Answered share of visible questions, 0..=100.
    pub progress: u8,
}

/// A supervisor notification raised by a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorNotice {
    pub question_id: Uuid,
    pub message: String,
}

/// Result of a successful completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub responses: Vec<ChecklistResponse>,
    pub score: ScoreBreakdown,
    pub action_plans: ActionPlanQueue,
    pub notifications: Vec<SupervisorNotice>,
}

/// One in-flight run of a template.
#[derive(Debug)]
pub struct ChecklistRun {
    template: ChecklistTemplate,
    evaluator: RuleEvaluator,
    responses: HashMap<Uuid, ChecklistResponse>,
}

impl ChecklistRun {
    pub fn new(template: ChecklistTemplate) -> Result<Self, RuleError> {
        let evaluator = RuleEvaluator::for_template(&template)?;
        Ok(Self {
            template,
            evaluator,
            responses: HashMap::new(),
        })
    }

    /// Resume from saved responses.
    pub fn with_responses(
        mut self,
        responses: impl IntoIterator<Item = ChecklistResponse>,
    ) -> Result<Self, ChecklistError> {
        for response in responses {
            self.question(response.question_id)?;
            self.responses.insert(response.question_id, response);
        }
        Ok(self)
    }

    pub fn template(&self) -> &ChecklistTemplate {
        &self.template
    }

    fn question(&self, id: Uuid) -> Result<&TemplateQuestion, ChecklistError> {
        self.template
            .question(id)
            .ok_or(ChecklistError::UnknownQuestion(id))
    }

    fn response_mut(&mut self, id: Uuid) -> Result<&mut ChecklistResponse, ChecklistError> {
        self.question(id)?;
        Ok(self
            .responses
            .entry(id)
            .or_insert_with(|| ChecklistResponse::new(id)))
    }

    pub fn answer(&mut self, question_id: Uuid, value: AnswerValue) -> Result<(), ChecklistError> {
        self.response_mut(question_id)?.value = Some(value);
        Ok(())
    }

    pub fn attach_photo(&mut self, question_id: Uuid, url: impl Into<String>) -> Result<(), ChecklistError> {
        self.response_mut(question_id)?.photo_urls.push(url.into());
        Ok(())
    }

    pub fn comment(&mut self, question_id: Uuid, text: impl Into<String>) -> Result<(), ChecklistError> {
        self.response_mut(question_id)?.comment = Some(text.into());
        Ok(())
    }

    pub fn answers(&self) -> Answers {
        self.responses
            .iter()
            .filter_map(|(id, r)| r.value.clone().map(|v| (*id, v)))
            .collect()
    }

    /// Photo questions are only answered by an attachment.
    fn is_answered(&self, q: &TemplateQuestion) -> bool {
        match q.question_type {
            QuestionType::Photo => self.has_photo(q.id),
            _ => self.responses.get(&q.id).is_some_and(ChecklistResponse::is_answered),
        }
    }

    fn photographed(&self) -> HashSet<Uuid> {
        self.responses
            .values()
            .filter(|r| !r.photo_urls.is_empty())
            .map(|r| r.question_id)
            .collect()
    }

    fn has_photo(&self, id: Uuid) -> bool {
        self.responses
            .get(&id)
            .is_some_and(|r| !r.photo_urls.is_empty())
    }

    pub fn evaluate(&self) -> RunEvaluation {
        let answers = self.answers();
        let visible_set = self.evaluator.visible_questions(&self.template, &answers);
        let triggered = self
            .evaluator
            .triggered_actions(&self.template, &answers, &visible_set);
        self.evaluation_from(&visible_set, triggered)
    }

    fn evaluation_from(&self, visible_set: &HashSet<Uuid>, triggered: Vec<TriggeredAction>) -> RunEvaluation {
        let visible: Vec<Uuid> = self
            .template
            .questions()
            .map(|q| q.id)
            .filter(|id| visible_set.contains(id))
            .collect();

        let photo_rule: HashSet<Uuid> = triggered
            .iter()
            .filter(|t| t.action == RuleAction::RequirePhoto)
            .map(|t| t.question_id)
            .collect();

        let photo_required: Vec<Uuid> = self
            .template
            .questions()
            .filter(|q| visible_set.contains(&q.id))
            .filter(|q| photo_rule.contains(&q.id))
            .map(|q| q.id)
            .collect();

        let missing_required: Vec<Uuid> = self
            .template
            .questions()
            .filter(|q| visible_set.contains(&q.id))
            .filter(|q| {
                (q.required && !self.is_answered(q))
                    || (photo_rule.contains(&q.id) && !self.has_photo(q.id))
            })
            .map(|q| q.id)
            .collect();

        let answered = self
            .template
            .questions()
            .filter(|q| visible_set.contains(&q.id) && self.is_answered(q))
            .count();
        let progress = match visible.len() {
            0 => 100,
            n => (answered * 100 / n) as u8,
        };

        RunEvaluation {
            visible,
            missing_required,
            photo_required,
            triggered,
            progress,
        }
    }

    /// Finish the run. Fails while any visible required question is unanswered.
    pub fn complete(
        &self,
        timing: &TimerSummary,
        config: &ScoringConfig,
        today: NaiveDate,
    ) -> Result<Completion, ChecklistError> {
        let answers = self.answers();
        let visible_set = self.evaluator.visible_questions(&self.template, &answers);
        let triggered = self
            .evaluator
            .triggered_actions(&self.template, &answers, &visible_set);
        let evaluation = self.evaluation_from(&visible_set, triggered);

        if !evaluation.missing_required.is_empty() {
            return Err(ChecklistError::Incomplete {
                missing: evaluation.missing_required,
            });
        }

        let score = scoring::score(
            &self.template,
            &answers,
            &self.photographed(),
            &visible_set,
            timing,
            config,
        );

        let mut drafts: Vec<ActionPlanDraft> = Vec::new();
        let mut notifications = Vec::new();
        for t in &evaluation.triggered {
            match &t.action {
                RuleAction::CreateActionPlan { title, due_in_days } => {
                    if drafts.iter().any(|d| d.question_id == t.question_id) {
                        continue;
                    }
                    if let Ok(q) = self.question(t.question_id) {
                        drafts.push(self.draft_for(q, title.as_deref(), *due_in_days, today));
                    }
                }
                RuleAction::NotifySupervisor { message } => {
                    let text = match (message, self.question(t.question_id)) {
                        (Some(m), _) => m.clone(),
                        (None, Ok(q)) => format!("Flagged answer on \"{}\"", q.text),
                        (None, Err(_)) => "Flagged answer".to_string(),
                    };
                    notifications.push(SupervisorNotice {
                        question_id: t.question_id,
                        message: text,
                    });
                }
                RuleAction::ShowQuestions { .. } | RuleAction::RequirePhoto => {}
            }
        }

        let flagged: HashSet<Uuid> = drafts.iter().map(|d| d.question_id).collect();
        let responses: Vec<ChecklistResponse> = self
            .template
            .questions()
            .filter(|q| visible_set.contains(&q.id))
            .filter_map(|q| {
                let mut r = self.responses.get(&q.id)?.clone();
                let answered_no = q.question_type == QuestionType::YesNo
                    && r.value.as_ref().and_then(AnswerValue::as_bool) == Some(false);
                r.has_issue = r.has_issue || flagged.contains(&q.id) || answered_no;
                Some(r)
            })
            .collect();

        info!(
            template_id = %self.template.id,
            score = score.total,
            drafts = drafts.len(),
            notifications = notifications.len(),
            "Checklist run completed"
        );

        Ok(Completion {
            responses,
            score,
            action_plans: ActionPlanQueue::new(drafts),
            notifications,
        })
    }

    fn draft_for(
        &self,
        q: &TemplateQuestion,
        title: Option<&str>,
        due_in_days: Option<u32>,
        today: NaiveDate,
    ) -> ActionPlanDraft {
        let response = self.responses.get(&q.id);
        let answer = response
            .and_then(|r| r.value.as_ref())
            .map(AnswerValue::stringify)
            .unwrap_or_default();
        let mut problem = format!("{}: {}", q.text, answer);
        if let Some(comment) = response.and_then(|r| r.comment.as_deref()) {
            problem.push_str(" - ");
            problem.push_str(comment);
        }

        ActionPlanDraft {
            question_id: q.id,
            title: title
                .map(str::to_string)
                .unwrap_or_else(|| format!("Fix: {}", q.text)),
            problem,
            due_date: due_in_days.and_then(|d| today.checked_add_days(Days::new(u64::from(d)))),
            evidence_urls: response.map(|r| r.photo_urls.clone()).unwrap_or_default(),
        }
    }
}
