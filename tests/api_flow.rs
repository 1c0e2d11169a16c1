//! End-to-end REST tests.
//!
//! Each test spins up the full router on a random port over an in-memory
//! database and drives it with reqwest.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;
use uuid::Uuid;

use shiftcheck::api::{self, AppState};
use shiftcheck::config::ScoringConfig;
use shiftcheck::evidence::{FallbackStore, LocalStore};
use shiftcheck::store::{Database, LibSqlBackend};

struct TestServer {
    base: String,
    http: reqwest::Client,
    _evidence_dir: TempDir,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let resp = self.http.post(self.url(path)).json(&body).send().await.unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn put(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let resp = self.http.put(self.url(path)).json(&body).send().await.unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let resp = self.http.get(self.url(path)).send().await.unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap_or(Value::Null))
    }
}

async fn start_server() -> TestServer {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let evidence_dir = TempDir::new().unwrap();
    let local = LocalStore::new(evidence_dir.path(), "/evidence");
    let evidence = Arc::new(FallbackStore::new(None, local));
    let state = AppState::new(db, ScoringConfig::default(), evidence, None);
    let app = api::router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        base: format!("http://127.0.0.1:{port}"),
        http: reqwest::Client::new(),
        _evidence_dir: evidence_dir,
    }
}

struct Closing {
    template_id: String,
    fridge: Uuid,
    floor: Uuid,
}

/// Easy, 10-minute template: fridge (required, 50 pts, flags a plan and a
/// supervisor notice on "no") and floor (weight 3, so 30 pts).
async fn create_closing(server: &TestServer) -> Closing {
    let fridge = Uuid::new_v4();
    let floor = Uuid::new_v4();
    let (status, body) = server
        .post(
            "/api/templates",
            json!({
                "title": "Closing",
                "estimated_minutes": 10,
                "sections": [{
                    "title": "Kitchen",
                    "questions": [
                        {
                            "id": fridge,
                            "text": "Walk-in below 5°C?",
                            "question_type": "yes_no",
                            "required": true,
                            "points": 50,
                            "conditional_rules": [
                                {
                                    "operator": "equals",
                                    "value": "no",
                                    "action": {
                                        "type": "create_action_plan",
                                        "title": "Fix walk-in",
                                        "due_in_days": 2
                                    }
                                },
                                {
                                    "operator": "equals",
                                    "value": "no",
                                    "action": { "type": "notify_supervisor" }
                                }
                            ]
                        },
                        {
                            "id": floor,
                            "text": "Floor mopped?",
                            "question_type": "yes_no",
                            "weight": 3
                        }
                    ]
                }]
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    Closing {
        template_id: body["id"].as_str().unwrap().to_string(),
        fridge,
        floor,
    }
}

async fn start_run(server: &TestServer, template_id: &str, user: &str) -> String {
    let (status, body) = server
        .post(
            "/api/checklists",
            json!({ "template_id": template_id, "user_id": user }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_reports_service() {
    let server = start_server().await;
    let (status, body) = server.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "shiftcheck");
}

#[tokio::test]
async fn template_edits_are_versioned() {
    let server = start_server().await;
    let t = create_closing(&server).await;

    let (_, template) = server.get(&format!("/api/templates/{}", t.template_id)).await;
    assert_eq!(template["version"], 1);

    let mut update = json!({
        "title": "Closing (v2)",
        "estimated_minutes": 12,
        "sections": template["sections"].clone(),
    });
    update["sections"][0]["questions"][1]["text"] = json!("Floor mopped and dry?");
    update["sections"][0]["questions"]
        .as_array_mut()
        .unwrap()
        .push(json!({ "text": "Lights off?", "question_type": "yes_no" }));

    let (status, updated) = server
        .put(&format!("/api/templates/{}", t.template_id), update)
        .await;
    assert_eq!(status, StatusCode::OK, "{updated}");
    assert_eq!(updated["version"], 2);
    assert_eq!(updated["created_at"], template["created_at"]);

    let (_, versions) = server
        .get(&format!("/api/templates/{}/versions", t.template_id))
        .await;
    let versions = versions.as_array().unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0]["version"], 2);
    assert_eq!(versions[0]["diff"]["added"], 1);
    assert_eq!(versions[0]["diff"]["modified"], 1);
    assert_eq!(versions[0]["diff"]["removed"], 0);
    assert_eq!(versions[1]["diff"]["added"], 2);
}

#[tokio::test]
async fn invalid_templates_are_rejected() {
    let server = start_server().await;

    let (status, _) = server
        .post(
            "/api/templates",
            json!({ "title": "Empty", "estimated_minutes": 5, "sections": [] }),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = server
        .post(
            "/api/templates",
            json!({
                "title": "Bad regex",
                "estimated_minutes": 5,
                "sections": [{
                    "title": "S",
                    "questions": [{
                        "text": "Code?",
                        "question_type": "text",
                        "conditional_rules": [{
                            "operator": "matches",
                            "value": "([",
                            "action": { "type": "require_photo" }
                        }]
                    }]
                }]
            }),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = server.get(&format!("/api/templates/{}", Uuid::new_v4())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn due_templates_follow_schedule() {
    let server = start_server().await;
    let (status, body) = server
        .post(
            "/api/templates",
            json!({
                "title": "Monday deep clean",
                "estimated_minutes": 30,
                "schedule": { "recurrence": "0 6 * * MON", "deadline": "10:00" },
                "sections": [{
                    "title": "Hood",
                    "questions": [{ "text": "Filters degreased?", "question_type": "yes_no" }]
                }]
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");

    // 2026-06-01 is a Monday.
    let (_, due) = server.get("/api/templates/due?date=2026-06-01").await;
    let due = due.as_array().unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0]["title"], "Monday deep clean");
    assert_eq!(due[0]["deadline"], "2026-06-01T10:00:00Z");

    let (_, due) = server.get("/api/templates/due?date=2026-06-02").await;
    assert!(due.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn checklist_run_scores_and_drafts_action_plans() {
    let server = start_server().await;
    let t = create_closing(&server).await;
    let run = start_run(&server, &t.template_id, "ana").await;

    // Required fridge question unanswered.
    let (status, body) = server
        .post(&format!("/api/checklists/{run}/complete"), json!({}))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["missing"], json!([t.fridge]));

    let (status, eval) = server
        .put(
            &format!("/api/checklists/{run}/responses"),
            json!([
                { "question_id": t.fridge, "value": false },
                { "question_id": t.floor, "value": true }
            ]),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{eval}");
    assert_eq!(eval["progress"], 100);
    assert_eq!(eval["triggered"].as_array().unwrap().len(), 2);

    // A draft is coming, so signing has to wait.
    let (status, body) = server
        .post(
            &format!("/api/checklists/{run}/complete"),
            json!({ "signature": "Ana" }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");
    let (_, view) = server.get(&format!("/api/checklists/{run}")).await;
    assert_eq!(view["checklist"]["status"], "in_progress");

    let (status, done) = server
        .post(&format!("/api/checklists/{run}/complete"), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK, "{done}");

    // base 30, speed floor(30*0.2)=6, focus floor(30*0.15)=4, easy x1.0
    assert_eq!(done["score"]["base"], 30);
    assert_eq!(done["score"]["speed_bonus"], 6);
    assert_eq!(done["score"]["focus_bonus"], 4);
    assert_eq!(done["score"]["total"], 40);
    assert_eq!(done["score"]["conformity"], 75.0);
    assert_eq!(done["checklist"]["status"], "completed");
    assert!(done["checklist"]["signature"].is_null());
    assert_eq!(done["xp_earned"], 40);
    assert_eq!(done["streak"], "reset");
    assert_eq!(done["profile"]["total_xp"], 40);
    assert_eq!(done["profile"]["streak_days"], 1);
    assert_eq!(done["notifications"].as_array().unwrap().len(), 1);

    let drafts = done["action_plans"]["pending"].as_array().unwrap();
    assert_eq!(drafts.len(), 1);
    assert_eq!(drafts[0]["title"], "Fix walk-in");
    assert_eq!(drafts[0]["question_id"], json!(t.fridge));

    // Completed runs are frozen.
    let (status, _) = server
        .post(&format!("/api/checklists/{run}/complete"), json!({}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = server
        .put(&format!("/api/checklists/{run}/responses"), json!([]))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, view) = server.get(&format!("/api/checklists/{run}")).await;
    let fridge_response = view["responses"]
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["question_id"] == json!(t.fridge))
        .cloned()
        .unwrap();
    assert_eq!(fridge_response["has_issue"], true);

    let (status, queue) = server.get(&format!("/api/checklists/{run}/drafts")).await;
    assert_eq!(status, StatusCode::OK, "{queue}");
    assert_eq!(queue["current"]["title"], "Fix walk-in");
    assert_eq!(queue["ready_for_signature"], false);

    let (status, _) = server
        .post(&format!("/api/checklists/{run}/sign"), json!({ "signature": "Ana" }))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Submit the draft, then resolve it for XP.
    let (status, submitted) = server
        .post(
            &format!("/api/checklists/{run}/drafts/submit"),
            json!({ "cost_type": "low", "estimated_cost": "35.00" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{submitted}");
    let plan = &submitted["plan"];
    assert_eq!(plan["status"], "pending");
    assert_eq!(plan["title"], "Fix walk-in");
    assert_eq!(plan["cost_type"], "low");
    assert_eq!(plan["question_id"], json!(t.fridge));
    assert_eq!(plan["checklist_id"], json!(run));
    assert_eq!(submitted["drafts"]["ready_for_signature"], true);
    assert_eq!(submitted["drafts"]["outcomes"][0]["outcome"], "submitted");
    let plan_id = plan["id"].as_str().unwrap();

    let (status, _) = server
        .post(&format!("/api/checklists/{run}/drafts/skip"), json!({}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT, "queue is drained");

    let (status, signed) = server
        .post(&format!("/api/checklists/{run}/sign"), json!({ "signature": "Ana" }))
        .await;
    assert_eq!(status, StatusCode::OK, "{signed}");
    assert_eq!(signed["signature"], "Ana");
    let (status, _) = server
        .post(&format!("/api/checklists/{run}/sign"), json!({ "signature": "Bo" }))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = server
        .post(
            &format!("/api/action-plans/{plan_id}/status"),
            json!({ "status": "resolved" }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT, "pending cannot jump to resolved");

    for next in ["in_progress", "resolved"] {
        let (status, body) = server
            .post(
                &format!("/api/action-plans/{plan_id}/status"),
                json!({ "status": next }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
    }

    let (_, profile) = server.get("/api/profiles/ana").await;
    assert_eq!(profile["total_xp"], 90);
    assert_eq!(profile["badges"], json!(["first_checklist"]));

    let (_, resolved) = server.get("/api/action-plans?status=resolved").await;
    assert_eq!(resolved.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn skipped_drafts_are_recorded_before_signing() {
    let server = start_server().await;
    let t = create_closing(&server).await;
    let run = start_run(&server, &t.template_id, "ana").await;

    let (status, _) = server.get(&format!("/api/checklists/{run}/drafts")).await;
    assert_eq!(status, StatusCode::CONFLICT, "run still in progress");

    let (status, done) = server
        .post(
            &format!("/api/checklists/{run}/complete"),
            json!({ "responses": [{ "question_id": t.fridge, "value": false }] }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{done}");

    let (status, queue) = server
        .post(&format!("/api/checklists/{run}/drafts/skip"), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK, "{queue}");
    assert_eq!(queue["skipped"], json!([t.fridge]));
    assert_eq!(queue["remaining"], 0);
    assert_eq!(queue["ready_for_signature"], true);

    let (_, plans) = server.get("/api/action-plans").await;
    assert!(plans.as_array().unwrap().is_empty());

    let (status, signed) = server
        .post(&format!("/api/checklists/{run}/sign"), json!({ "signature": "Ana" }))
        .await;
    assert_eq!(status, StatusCode::OK, "{signed}");
}

#[tokio::test]
async fn clean_run_can_be_signed_on_completion() {
    let server = start_server().await;
    let t = create_closing(&server).await;
    let run = start_run(&server, &t.template_id, "ana").await;

    let (status, done) = server
        .post(
            &format!("/api/checklists/{run}/complete"),
            json!({
                "responses": [{ "question_id": t.fridge, "value": true }],
                "signature": "Ana"
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{done}");
    assert_eq!(done["checklist"]["signature"], "Ana");

    let (_, queue) = server.get(&format!("/api/checklists/{run}/drafts")).await;
    assert_eq!(queue["ready_for_signature"], true);
    let (status, _) = server
        .post(&format!("/api/checklists/{run}/sign"), json!({ "signature": "Ana" }))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn concurrent_completions_are_applied_once() {
    let server = start_server().await;
    let t = create_closing(&server).await;
    let run = start_run(&server, &t.template_id, "ana").await;

    let (status, _) = server
        .put(
            &format!("/api/checklists/{run}/responses"),
            json!([
                { "question_id": t.fridge, "value": true },
                { "question_id": t.floor, "value": true }
            ]),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let path = format!("/api/checklists/{run}/complete");
    let attempts = (0..8).map(|_| server.post(&path, json!({})));
    let results = futures::future::join_all(attempts).await;

    let ok: Vec<&Value> = results
        .iter()
        .filter(|(status, _)| *status == StatusCode::OK)
        .map(|(_, body)| body)
        .collect();
    assert_eq!(ok.len(), 1, "{results:?}");
    assert!(
        results
            .iter()
            .all(|(status, _)| *status == StatusCode::OK || *status == StatusCode::CONFLICT)
    );
    // base 80, speed 16, focus 12, easy x1.0
    assert_eq!(ok[0]["score"]["total"], 108);

    let (_, profile) = server.get("/api/profiles/ana").await;
    assert_eq!(profile["total_xp"], 108);
    assert_eq!(profile["checklists_completed"], 1);
    assert_eq!(profile["streak_days"], 1);
}

#[tokio::test]
async fn concurrent_resolutions_award_xp_once() {
    let server = start_server().await;
    let (status, plan) = server
        .post("/api/action-plans", json!({ "user_id": "carla", "title": "Replace door seal" }))
        .await;
    assert_eq!(status, StatusCode::CREATED, "{plan}");
    let plan_id = plan["id"].as_str().unwrap();
    let path = format!("/api/action-plans/{plan_id}/status");

    let (status, _) = server.post(&path, json!({ "status": "in_progress" })).await;
    assert_eq!(status, StatusCode::OK);

    let attempts = (0..8).map(|_| server.post(&path, json!({ "status": "resolved" })));
    let results = futures::future::join_all(attempts).await;
    let resolved = results.iter().filter(|(status, _)| *status == StatusCode::OK).count();
    assert_eq!(resolved, 1, "{results:?}");
    assert!(
        results
            .iter()
            .all(|(status, _)| *status == StatusCode::OK || *status == StatusCode::CONFLICT)
    );

    let (_, profile) = server.get("/api/profiles/carla").await;
    assert_eq!(profile["total_xp"], 50);
}

#[tokio::test]
async fn evaluate_previews_without_saving() {
    let server = start_server().await;
    let t = create_closing(&server).await;
    let run = start_run(&server, &t.template_id, "bo").await;

    let (status, eval) = server
        .post(
            &format!("/api/checklists/{run}/evaluate"),
            json!({ "responses": [{ "question_id": t.fridge, "value": true }] }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(eval["progress"], 50);
    assert!(eval["missing_required"].as_array().unwrap().is_empty());

    let (_, view) = server.get(&format!("/api/checklists/{run}")).await;
    assert!(view["responses"].as_array().unwrap().is_empty());
    assert_eq!(view["evaluation"]["missing_required"], json!([t.fridge]));
}

#[tokio::test]
async fn unknown_question_is_bad_request() {
    let server = start_server().await;
    let t = create_closing(&server).await;
    let run = start_run(&server, &t.template_id, "ana").await;

    let (status, _) = server
        .put(
            &format!("/api/checklists/{run}/responses"),
            json!([{ "question_id": Uuid::new_v4(), "value": true }]),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn evidence_falls_back_to_local_disk() {
    let server = start_server().await;
    let t = create_closing(&server).await;
    let run = start_run(&server, &t.template_id, "ana").await;

    let photo = vec![0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3];
    let resp = server
        .http
        .post(server.url(&format!(
            "/api/checklists/{run}/evidence?question_id={}",
            t.fridge
        )))
        .header("content-type", "image/jpeg")
        .body(photo.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let stored: Value = resp.json().await.unwrap();
    assert_eq!(stored["durable"], false);
    let url = stored["url"].as_str().unwrap();
    assert!(url.starts_with("/evidence/checklists/"));
    assert!(url.ends_with(".jpg"));

    let resp = server.http.get(server.url(url)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "image/jpeg");
    assert_eq!(resp.bytes().await.unwrap().to_vec(), photo);

    let (_, view) = server.get(&format!("/api/checklists/{run}")).await;
    assert_eq!(view["responses"][0]["photo_urls"], json!([url]));
}

#[tokio::test]
async fn sync_without_notion_is_unavailable() {
    let server = start_server().await;
    let (status, body) = server.post("/api/action-plans/sync", json!({})).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("not configured"));
}
