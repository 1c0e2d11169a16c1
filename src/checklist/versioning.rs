//! Template snapshots: what changed between two saves.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::model::{ChecklistTemplate, TemplateQuestion};

/// Question-level change counts between two template versions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateDiff {
    pub added: u32,
    pub removed: u32,
    pub modified: u32,
}

impl TemplateDiff {
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.removed == 0 && self.modified == 0
    }
}

/// A stored snapshot row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateVersion {
    pub template_id: Uuid,
    pub version: u32,
    pub diff: TemplateDiff,
    pub snapshot: ChecklistTemplate,
    pub created_at: DateTime<Utc>,
}

fn content_differs(a: &TemplateQuestion, b: &TemplateQuestion) -> bool {
    a.text != b.text
        || a.question_type != b.question_type
        || a.required != b.required
        || a.effective_weight() != b.effective_weight()
        || a.effective_points() != b.effective_points()
        || a.options != b.options
        || a.conditional_rules != b.conditional_rules
        || a.media_instructions != b.media_instructions
}

/// Compare questions by id. A question moved between sections is not a change.
pub fn diff(previous: Option<&ChecklistTemplate>, current: &ChecklistTemplate) -> TemplateDiff {
    let Some(previous) = previous else {
        return TemplateDiff {
            added: current.question_count() as u32,
            ..TemplateDiff::default()
        };
    };

    let before: HashMap<Uuid, &TemplateQuestion> = previous.questions().map(|q| (q.id, q)).collect();
    let after: HashMap<Uuid, &TemplateQuestion> = current.questions().map(|q| (q.id, q)).collect();

    let mut out = TemplateDiff::default();
    for (id, q) in &after {
        match before.get(id) {
            None => out.added += 1,
            Some(old) if content_differs(old, q) => out.modified += 1,
            Some(_) => {}
        }
    }
    out.removed = before.keys().filter(|id| !after.contains_key(*id)).count() as u32;
    out
}
