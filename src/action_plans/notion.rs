//! Notion sync for action plans.
//!
//! Pull maps database pages into [`RemotePlan`]s and upserts them by the local
//! id stored on the page. Pages without a usable local id become new plans and
//! get the new id written back. Push creates pages for local plans that have
//! never been mirrored. Errors are reported, never retried.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{ActionPlan, ActionPlanStatus, CostType};
use crate::config::NotionConfig;
use crate::error::SyncError;
use crate::store::Database;

pub const NOTION_VERSION: &str = "2022-06-28";

/// Owner recorded for plans that were created on the Notion side.
pub const REMOTE_OWNER: &str = "notion";

const PAGE_SIZE: u32 = 100;

/// Property names in the Notion database.
pub mod props {
    pub const TITLE: &str = "Name";
    pub const PROBLEM: &str = "Problem";
    pub const DUE_DATE: &str = "Due date";
    pub const COST_TYPE: &str = "Cost type";
    pub const STATUS: &str = "Status";
    pub const XP: &str = "XP";
    pub const EVIDENCE: &str = "Evidence";
    pub const LOCAL_ID: &str = "Local ID";
}

/// An action plan as read from a Notion page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePlan {
    pub page_id: String,
    pub local_id: Option<Uuid>,
    pub title: String,
    pub problem: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub cost_type: Option<CostType>,
    pub status: Option<ActionPlanStatus>,
    pub xp: Option<u32>,
    pub evidence_urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub page_id: Option<String>,
    pub reason: String,
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub pulled: usize,
    pub created: usize,
    pub updated: usize,
    pub pushed: usize,
    pub failures: Vec<SyncFailure>,
}

/// Minimal Notion REST client.
pub struct NotionClient {
    config: NotionConfig,
    client: reqwest::Client,
}

impl NotionClient {
    pub fn new(config: NotionConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        self.config.sync_interval
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.config.api_url.trim_end_matches('/'))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, SyncError> {
        let resp = request
            .bearer_auth(self.config.token.expose_secret())
            .header("Notion-Version", NOTION_VERSION)
            .send()
            .await
            .map_err(|e| SyncError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::Api {
                status: status.as_u16(),
                body,
            });
        }
        resp.json()
            .await
            .map_err(|e| SyncError::Request(format!("invalid response body: {e}")))
    }

    /// Fetch every page of the configured database.
    pub async fn query_pages(&self) -> Result<Vec<Value>, SyncError> {
        let url = self.url(&format!("databases/{}/query", self.config.database_id));
        let mut pages = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut body = json!({ "page_size": PAGE_SIZE });
            if let Some(c) = &cursor {
                body["start_cursor"] = json!(c);
            }
            let data = self.send(self.client.post(&url).json(&body)).await?;

            if let Some(results) = data["results"].as_array() {
                pages.extend(results.iter().cloned());
            }
            cursor = match (data["has_more"].as_bool(), data["next_cursor"].as_str()) {
                (Some(true), Some(next)) => Some(next.to_string()),
                _ => break,
            };
            debug!(fetched = pages.len(), "Fetching next Notion page batch");
        }
        Ok(pages)
    }

    /// Store the local row id on the page.
    pub async fn write_local_id(&self, page_id: &str, local_id: Uuid) -> Result<(), SyncError> {
        let body = json!({
            "properties": { props::LOCAL_ID: rich_text(&local_id.to_string()) }
        });
        self.send(self.client.patch(self.url(&format!("pages/{page_id}"))).json(&body))
            .await?;
        Ok(())
    }

    /// Create a page for a local plan. Returns the new page id.
    pub async fn create_page(&self, plan: &ActionPlan) -> Result<String, SyncError> {
        let body = json!({
            "parent": { "database_id": self.config.database_id },
            "properties": plan_properties(plan),
        });
        let data = self
            .send(self.client.post(self.url("pages")).json(&body))
            .await?;
        data["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| SyncError::Request("created page has no id".into()))
    }
}

fn rich_text(content: &str) -> Value {
    json!({ "rich_text": [{ "type": "text", "text": { "content": content } }] })
}

fn plan_properties(plan: &ActionPlan) -> Value {
    let mut properties = json!({
        props::TITLE: { "title": [{ "type": "text", "text": { "content": plan.title } }] },
        props::PROBLEM: rich_text(&plan.problem),
        props::COST_TYPE: { "select": { "name": plan.cost_type.as_str() } },
        props::STATUS: { "select": { "name": plan.status.as_str() } },
        props::XP: { "number": plan.xp_reward },
        props::LOCAL_ID: rich_text(&plan.id.to_string()),
    });
    if let Some(due) = plan.due_date {
        properties[props::DUE_DATE] = json!({ "date": { "start": due.to_string() } });
    }
    if !plan.evidence_urls.is_empty() {
        let files: Vec<Value> = plan
            .evidence_urls
            .iter()
            .enumerate()
            .map(|(i, url)| {
                json!({
                    "name": format!("evidence-{}", i + 1),
                    "type": "external",
                    "external": { "url": url },
                })
            })
            .collect();
        properties[props::EVIDENCE] = json!({ "files": files });
    }
    properties
}

fn plain_text(items: &Value) -> Option<String> {
    let text: String = items
        .as_array()?
        .iter()
        .filter_map(|t| t["plain_text"].as_str().or_else(|| t["text"]["content"].as_str()))
        .collect();
    let text = text.trim().to_string();
    (!text.is_empty()).then_some(text)
}

fn select_name(prop: &Value) -> Option<&str> {
    prop["select"]["name"]
        .as_str()
        .or_else(|| prop["status"]["name"].as_str())
}

fn evidence_urls(prop: &Value) -> Vec<String> {
    if let Some(files) = prop["files"].as_array() {
        return files
            .iter()
            .filter_map(|f| {
                f["external"]["url"]
                    .as_str()
                    .or_else(|| f["file"]["url"].as_str())
                    .map(str::to_string)
            })
            .collect();
    }
    if let Some(url) = prop["url"].as_str() {
        return vec![url.to_string()];
    }
    plain_text(&prop["rich_text"])
        .map(|s| {
            s.split([',', '\n'])
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Map a raw page object into a [`RemotePlan`].
pub fn parse_page(page: &Value) -> Result<RemotePlan, SyncError> {
    let page_id = page["id"]
        .as_str()
        .ok_or_else(|| SyncError::MalformedPage {
            page_id: "<unknown>".into(),
            reason: "missing id".into(),
        })?
        .to_string();
    let p = &page["properties"];

    let title = plain_text(&p[props::TITLE]["title"]).ok_or_else(|| SyncError::MalformedPage {
        page_id: page_id.clone(),
        reason: format!("empty '{}' property", props::TITLE),
    })?;

    let due_date = p[props::DUE_DATE]["date"]["start"]
        .as_str()
        .and_then(|s| s.get(..10))
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());

    Ok(RemotePlan {
        local_id: plain_text(&p[props::LOCAL_ID]["rich_text"]).and_then(|s| Uuid::parse_str(&s).ok()),
        title,
        problem: plain_text(&p[props::PROBLEM]["rich_text"]),
        due_date,
        cost_type: select_name(&p[props::COST_TYPE]).and_then(CostType::parse),
        status: select_name(&p[props::STATUS]).and_then(ActionPlanStatus::parse),
        xp: p[props::XP]["number"].as_f64().map(|n| n.max(0.0) as u32),
        evidence_urls: evidence_urls(&p[props::EVIDENCE]),
        page_id,
    })
}

/// Copy remote fields onto `plan`. Returns XP earned if the remote side resolved it.
pub fn apply_remote(plan: &mut ActionPlan, remote: &RemotePlan) -> u32 {
    plan.title = remote.title.clone();
    if let Some(problem) = &remote.problem {
        plan.problem = problem.clone();
    }
    if remote.due_date.is_some() {
        plan.due_date = remote.due_date;
    }
    if let Some(cost) = remote.cost_type {
        plan.cost_type = cost;
    }
    if let Some(xp) = remote.xp {
        plan.xp_reward = xp;
    }
    if !remote.evidence_urls.is_empty() {
        plan.evidence_urls = remote.evidence_urls.clone();
    }
    plan.notion_page_id = Some(remote.page_id.clone());
    plan.updated_at = chrono::Utc::now();

    let Some(status) = remote.status else {
        return 0;
    };
    if status == plan.status || plan.status.is_terminal() {
        return 0;
    }
    plan.status = status;
    if status != ActionPlanStatus::Resolved {
        return 0;
    }
    plan.resolved_at = Some(plan.updated_at);
    plan.xp_awarded = plan.xp_reward;
    plan.xp_reward
}

async fn pull_page(
    db: &dyn Database,
    client: &NotionClient,
    remote: &RemotePlan,
) -> Result<bool, SyncError> {
    let existing = match remote.local_id {
        Some(id) => db.get_action_plan(id).await?,
        None => None,
    };
    let existing = match existing {
        Some(plan) => Some(plan),
        None => db.find_action_plan_by_notion_page(&remote.page_id).await?,
    };

    if let Some(mut plan) = existing {
        let from = plan.status;
        let earned = apply_remote(&mut plan, remote);
        if !db.update_action_plan(&plan, from).await? {
            return Err(SyncError::Conflict { id: plan.id });
        }
        super::award_resolution_xp(db, &plan.user_id, earned).await?;
        if remote.local_id != Some(plan.id) {
            client.write_local_id(&remote.page_id, plan.id).await?;
        }
        return Ok(false);
    }

    let mut plan = ActionPlan::new(REMOTE_OWNER, remote.title.clone())
        .map_err(|e| SyncError::MalformedPage {
            page_id: remote.page_id.clone(),
            reason: e.to_string(),
        })?;
    apply_remote(&mut plan, remote);
    db.insert_action_plan(&plan).await?;
    client.write_local_id(&remote.page_id, plan.id).await?;
    Ok(true)
}

/// Pull remote pages into the local store.
pub async fn pull(db: &dyn Database, client: &NotionClient, report: &mut SyncReport) -> Result<(), SyncError> {
    let pages = client.query_pages().await?;
    report.pulled = pages.len();

    for page in &pages {
        let outcome = match parse_page(page) {
            Ok(remote) => pull_page(db, client, &remote).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(true) => report.created += 1,
            Ok(false) => report.updated += 1,
            Err(e) => {
                let page_id = page["id"].as_str().map(str::to_string);
                warn!(page_id = ?page_id, error = %e, "Failed to sync Notion page");
                report.failures.push(SyncFailure {
                    page_id,
                    reason: e.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Create pages for local plans that were never mirrored.
pub async fn push(db: &dyn Database, client: &NotionClient, report: &mut SyncReport) -> Result<(), SyncError> {
    for mut plan in db.list_unsynced_action_plans().await? {
        match client.create_page(&plan).await {
            Ok(page_id) => {
                plan.notion_page_id = Some(page_id);
                if db.update_action_plan(&plan, plan.status).await? {
                    report.pushed += 1;
                } else {
                    warn!(plan_id = %plan.id, "Action plan changed while pushing to Notion");
                    report.failures.push(SyncFailure {
                        page_id: plan.notion_page_id.clone(),
                        reason: SyncError::Conflict { id: plan.id }.to_string(),
                    });
                }
            }
            Err(e) => {
                warn!(plan_id = %plan.id, error = %e, "Failed to push action plan to Notion");
                report.failures.push(SyncFailure {
                    page_id: None,
                    reason: format!("plan {}: {e}", plan.id),
                });
            }
        }
    }
    Ok(())
}

/// Full pass: pull then push.
pub async fn sync(db: &dyn Database, client: &NotionClient) -> Result<SyncReport, SyncError> {
    let mut report = SyncReport::default();
    pull(db, client, &mut report).await?;
    push(db, client, &mut report).await?;
    info!(
        pulled = report.pulled,
        created = report.created,
        updated = report.updated,
        pushed = report.pushed,
        failed = report.failures.len(),
        "Notion sync finished"
    );
    Ok(report)
}

/// Run [`sync`] every `interval`, skipping the immediate first tick.
pub fn spawn_sync_ticker(
    db: Arc<dyn Database>,
    client: Arc<NotionClient>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = sync(db.as_ref(), &client).await {
                warn!(error = %e, "Periodic Notion sync failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(id: &str, props: Value) -> Value {
        json!({ "id": id, "properties": props })
    }

    fn title(text: &str) -> Value {
        json!({ "title": [{ "plain_text": text }] })
    }

    #[test]
    fn parses_full_page() {
        let local = Uuid::new_v4();
        let p = page(
            "page-1",
            json!({
                "Name": title("Replace seal"),
                "Problem": { "rich_text": [{ "plain_text": "Door " }, { "plain_text": "leaks" }] },
                "Due date": { "date": { "start": "2026-07-10T09:00:00.000Z" } },
                "Cost type": { "select": { "name": "High" } },
                "Status": { "status": { "name": "In progress" } },
                "XP": { "number": 75 },
                "Evidence": { "files": [
                    { "type": "external", "external": { "url": "https://a/1.jpg" } },
                    { "type": "file", "file": { "url": "https://s3/2.jpg" } }
                ] },
                "Local ID": { "rich_text": [{ "plain_text": local.to_string() }] }
            }),
        );
        let r = parse_page(&p).unwrap();
        assert_eq!(r.page_id, "page-1");
        assert_eq!(r.local_id, Some(local));
        assert_eq!(r.title, "Replace seal");
        assert_eq!(r.problem.as_deref(), Some("Door leaks"));
        assert_eq!(r.due_date, NaiveDate::from_ymd_opt(2026, 7, 10));
        assert_eq!(r.cost_type, Some(CostType::High));
        assert_eq!(r.status, Some(ActionPlanStatus::InProgress));
        assert_eq!(r.xp, Some(75));
        assert_eq!(r.evidence_urls, vec!["https://a/1.jpg", "https://s3/2.jpg"]);
    }

    #[test]
    fn missing_properties_are_none() {
        let r = parse_page(&page("p", json!({ "Name": title("Only title") }))).unwrap();
        assert!(r.local_id.is_none());
        assert!(r.due_date.is_none());
        assert!(r.status.is_none());
        assert!(r.evidence_urls.is_empty());
    }

    #[test]
    fn garbage_local_id_is_ignored() {
        let r = parse_page(&page(
            "p",
            json!({
                "Name": title("T"),
                "Local ID": { "rich_text": [{ "plain_text": "not-a-uuid" }] }
            }),
        ))
        .unwrap();
        assert!(r.local_id.is_none());
    }

    #[test]
    fn untitled_page_is_malformed() {
        let err = parse_page(&page("p9", json!({ "Name": { "title": [] } }))).unwrap_err();
        assert!(matches!(err, SyncError::MalformedPage { page_id, .. } if page_id == "p9"));
    }

    #[test]
    fn evidence_from_comma_separated_text() {
        let r = parse_page(&page(
            "p",
            json!({
                "Name": title("T"),
                "Evidence": { "rich_text": [{ "plain_text": "https://a, https://b" }] }
            }),
        ))
        .unwrap();
        assert_eq!(r.evidence_urls, vec!["https://a", "https://b"]);
    }

    #[test]
    fn remote_resolution_awards_xp_once() {
        let mut plan = ActionPlan::new("ana", "Fix").unwrap().with_xp_reward(40);
        let remote = RemotePlan {
            page_id: "pg".into(),
            local_id: Some(plan.id),
            title: "Fix door".into(),
            problem: None,
            due_date: None,
            cost_type: None,
            status: Some(ActionPlanStatus::Resolved),
            xp: None,
            evidence_urls: vec![],
        };
        assert_eq!(apply_remote(&mut plan, &remote), 40);
        assert_eq!(plan.title, "Fix door");
        assert_eq!(plan.notion_page_id.as_deref(), Some("pg"));
        assert_eq!(apply_remote(&mut plan, &remote), 0);
    }

    #[test]
    fn properties_include_local_id_and_evidence() {
        let mut plan = ActionPlan::new("ana", "Fix").unwrap();
        plan.evidence_urls = vec!["https://a/1.jpg".into()];
        let props = plan_properties(&plan);
        assert_eq!(
            props["Local ID"]["rich_text"][0]["text"]["content"],
            plan.id.to_string()
        );
        assert_eq!(props["Evidence"]["files"][0]["external"]["url"], "https://a/1.jpg");
        assert_eq!(props["Status"]["select"]["name"], "pending");
        assert!(props.get("Due date").is_none());
    }
}
