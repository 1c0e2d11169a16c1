//! Conditional rule evaluation.
//!
//! Each question may carry rules of the form *condition → action*. A rule
//! matches when its own condition holds against the owning question's answer
//! and every nested condition holds as well (nested conditions are only
//! looked at once the parent matched). All matching sibling rules fire, in
//! declaration order.
//!
//! Comparisons run on the stringified answer, so `true` and `"yes"` are the
//! same thing to an `equals` rule.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::model::{AnswerValue, ChecklistTemplate, ConditionalRule, RuleAction, RuleOperator};
use crate::error::RuleError;

/// Answers keyed by question id.
pub type Answers = HashMap<Uuid, AnswerValue>;

/// A rule that matched, identified by its owner and position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggeredAction {
    pub question_id: Uuid,
    pub rule_index: usize,
    pub action: RuleAction,
}

/// Evaluates conditional rules for one template.
///
/// `matches` patterns are compiled once up front so a bad pattern is
/// reported when the evaluator is built, not silently at answer time.
#[derive(Debug, Default)]
pub struct RuleEvaluator {
    patterns: HashMap<String, Regex>,
}

impl RuleEvaluator {
    /// Build an evaluator, compiling every regex the template uses.
    pub fn for_template(template: &ChecklistTemplate) -> Result<Self, RuleError> {
        let mut patterns = HashMap::new();
        let conditions = template.questions().flat_map(|q| {
            q.conditional_rules.iter().flat_map(|r| {
                std::iter::once((r.operator, r.value.as_str()))
                    .chain(r.nested.iter().map(|c| (c.operator, c.value.as_str())))
            })
        });
        for (operator, pattern) in conditions {
            if operator == RuleOperator::Matches && !patterns.contains_key(pattern) {
                let regex = Regex::new(pattern).map_err(|e| RuleError::InvalidPattern {
                    pattern: pattern.to_string(),
                    reason: e.to_string(),
                })?;
                patterns.insert(pattern.to_string(), regex);
            }
        }
        Ok(Self { patterns })
    }

    /// Compare an answer against a trigger value.
    ///
    /// Unanswered questions only satisfy `is_empty`.
    pub fn compare(
        &self,
        operator: RuleOperator,
        expected: &str,
        actual: Option<&AnswerValue>,
    ) -> bool {
        let Some(actual) = actual else {
            return operator == RuleOperator::IsEmpty;
        };

        match operator {
            RuleOperator::IsEmpty => actual.is_empty(),
            RuleOperator::IsNotEmpty => !actual.is_empty(),
            RuleOperator::Equals => normalize(&actual.stringify()) == normalize(expected),
            RuleOperator::NotEquals => normalize(&actual.stringify()) != normalize(expected),
            RuleOperator::Contains => {
                let needle = normalize(expected);
                match actual {
                    AnswerValue::List(items) => items.iter().any(|i| normalize(i) == needle),
                    other => normalize(&other.stringify()).contains(&needle),
                }
            }
            RuleOperator::GreaterThan | RuleOperator::LessThan => {
                let (Some(lhs), Some(rhs)) = (actual.as_number(), parse_number(expected)) else {
                    return false;
                };
                if operator == RuleOperator::GreaterThan {
                    lhs > rhs
                } else {
                    lhs < rhs
                }
            }
            RuleOperator::Matches => self
                .patterns
                .get(expected)
                .is_some_and(|re| re.is_match(&actual.stringify())),
        }
    }

    /// Whether `rule`, owned by question `owner`, matches the current answers.
    pub fn rule_matches(&self, owner: Uuid, rule: &ConditionalRule, answers: &Answers) -> bool {
        if !self.compare(rule.operator, &rule.value, answers.get(&owner)) {
            return false;
        }
        rule.nested.iter().all(|cond| {
            let subject = cond.question_id.unwrap_or(owner);
            self.compare(cond.operator, &cond.value, answers.get(&subject))
        })
    }

    /// Question ids currently visible.
    ///
    /// Questions targeted by a `show_questions` rule start hidden and become
    /// visible once a visible question's matching rule reveals them. This is
    /// a fixed point over the visible set, so show cycles terminate and a
    /// question reachable only through hidden questions stays hidden.
    pub fn visible_questions(&self, template: &ChecklistTemplate, answers: &Answers) -> HashSet<Uuid> {
        let gated: HashSet<Uuid> = template
            .questions()
            .flat_map(|q| q.conditional_rules.iter())
            .filter_map(|r| match &r.action {
                RuleAction::ShowQuestions { question_ids } => Some(question_ids.iter().copied()),
                _ => None,
            })
            .flatten()
            .collect();

        let mut visible: HashSet<Uuid> = template
            .questions()
            .map(|q| q.id)
            .filter(|id| !gated.contains(id))
            .collect();

        loop {
            let mut revealed: Vec<Uuid> = Vec::new();
            for q in template.questions().filter(|q| visible.contains(&q.id)) {
                for rule in &q.conditional_rules {
                    if let RuleAction::ShowQuestions { question_ids } = &rule.action {
                        if self.rule_matches(q.id, rule, answers) {
                            revealed.extend(
                                question_ids.iter().copied().filter(|id| !visible.contains(id)),
                            );
                        }
                    }
                }
            }
            if revealed.is_empty() {
                break;
            }
            visible.extend(revealed);
        }

        visible
    }

    /// All rules that fire for visible questions, in template order.
    ///
    /// Each `(question, rule)` pair appears at most once.
    pub fn triggered_actions(
        &self,
        template: &ChecklistTemplate,
        answers: &Answers,
        visible: &HashSet<Uuid>,
    ) -> Vec<TriggeredAction> {
        let mut triggered = Vec::new();
        for q in template.questions().filter(|q| visible.contains(&q.id)) {
            for (rule_index, rule) in q.conditional_rules.iter().enumerate() {
                if self.rule_matches(q.id, rule, answers) {
                    debug!(
                        question_id = %q.id,
                        rule_index,
                        action = rule.action.label(),
                        "Conditional rule matched"
                    );
                    triggered.push(TriggeredAction {
                        question_id: q.id,
                        rule_index,
                        action: rule.action.clone(),
                    });
                }
            }
        }
        triggered
    }
}

fn normalize(s: &str) -> String {
    match s.trim().to_lowercase().as_str() {
        "true" => "yes".to_string(),
        "false" => "no".to_string(),
        other => other.to_string(),
    }
}

fn parse_number(s: &str) -> Option<f64> {
    s.trim().replace(',', ".").parse().ok()
}
