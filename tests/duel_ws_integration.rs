//! Integration tests for duels and the `/ws/duels` feed.
//!
//! Each test spins up the router on a random port, connects via
//! tokio-tungstenite, and drives duels through the REST API.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::StatusCode;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use uuid::Uuid;

use shiftcheck::api::{self, AppState};
use shiftcheck::config::ScoringConfig;
use shiftcheck::evidence::{FallbackStore, LocalStore};
use shiftcheck::store::{Database, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
    port: u16,
    http: reqwest::Client,
    _dir: TempDir,
}

impl Server {
    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let resp = self
            .http
            .post(format!("http://127.0.0.1:{}{path}", self.port))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn put(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let resp = self
            .http
            .put(format!("http://127.0.0.1:{}{path}", self.port))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn get(&self, path: &str) -> Value {
        self.http
            .get(format!("http://127.0.0.1:{}{path}", self.port))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn connect(&self, query: &str) -> Ws {
        let (ws, _resp) = connect_async(format!("ws://127.0.0.1:{}/ws/duels{query}", self.port))
            .await
            .expect("WS connect failed");
        ws
    }
}

/// Start an Axum server on a random port.
async fn start_server() -> Server {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let dir = TempDir::new().unwrap();
    let evidence = Arc::new(FallbackStore::new(None, LocalStore::new(dir.path(), "/evidence")));
    let app = api::router(AppState::new(db, ScoringConfig::default(), evidence, None));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Server {
        port,
        http: reqwest::Client::new(),
        _dir: dir,
    }
}

/// Parse a WS text frame into a serde_json::Value.
fn parse_ws_json(msg: &Message) -> Value {
    match msg {
        Message::Text(txt) => serde_json::from_str(txt).expect("invalid JSON from server"),
        other => panic!("expected Text frame, got {:?}", other),
    }
}

/// Read frames until one of type `kind` arrives.
async fn next_of_type(ws: &mut Ws, kind: &str) -> Value {
    loop {
        let msg = ws.next().await.unwrap().unwrap();
        let json = parse_ws_json(&msg);
        if json["type"] == kind {
            return json;
        }
    }
}

struct Template {
    id: String,
    fridge: Uuid,
    floor: Uuid,
}

async fn create_template(server: &Server) -> Template {
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
                        { "id": fridge, "text": "Walk-in cold?", "question_type": "yes_no",
                          "required": true, "points": 50 },
                        { "id": floor, "text": "Floor mopped?", "question_type": "yes_no",
                          "weight": 3 }
                    ]
                }]
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    Template {
        id: body["id"].as_str().unwrap().to_string(),
        fridge,
        floor,
    }
}

async fn create_duel(server: &Server, template: &Template, wager: u32) -> String {
    let (status, body) = server
        .post(
            "/api/duels",
            json!({
                "template_id": template.id,
                "challenger": "ana",
                "opponent": "bo",
                "wager": wager
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["status"], "pending");
    body["id"].as_str().unwrap().to_string()
}

/// Start, answer and complete a run; returns the completion body.
async fn play(server: &Server, template: &Template, user: &str, fridge: bool, floor: bool) -> Value {
    let (_, run) = server
        .post(
            "/api/checklists",
            json!({ "template_id": template.id, "user_id": user }),
        )
        .await;
    let run_id = run["id"].as_str().unwrap();
    let (status, _) = server
        .put(
            &format!("/api/checklists/{run_id}/responses"),
            json!([
                { "question_id": template.fridge, "value": fridge },
                { "question_id": template.floor, "value": floor }
            ]),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, done) = server
        .post(&format!("/api/checklists/{run_id}/complete"), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK, "{done}");
    done
}

// ── WebSocket Tests ──────────────────────────────────────────────────

#[tokio::test]
async fn ws_connect_receives_empty_sync() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let mut ws = server.connect("").await;

        let msg = ws.next().await.unwrap().unwrap();
        let json = parse_ws_json(&msg);
        assert_eq!(json["type"], "duels_sync");
        assert!(json["duels"].as_array().unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_sync_is_filtered_by_user() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let template = create_template(&server).await;
        let duel_id = create_duel(&server, &template, 10).await;

        let mut ws = server.connect("?user_id=bo").await;
        let json = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(json["duels"][0]["id"], duel_id);

        let mut ws = server.connect("?user_id=cy").await;
        let json = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert!(json["duels"].as_array().unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn duel_is_played_and_settled_over_the_feed() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let template = create_template(&server).await;

        let mut ws = server.connect("").await;
        let _ = next_of_type(&mut ws, "duels_sync").await;

        let duel_id = create_duel(&server, &template, 20).await;
        let created = next_of_type(&mut ws, "duel_created").await;
        assert_eq!(created["duel"]["id"], duel_id);

        let (status, _) = server
            .post(&format!("/api/duels/{duel_id}/accept"), json!({ "user_id": "bo" }))
            .await;
        assert_eq!(status, StatusCode::OK);
        let accepted = next_of_type(&mut ws, "duel_updated").await;
        assert_eq!(accepted["duel"]["status"], "active");

        // ana: 80 base + 16 speed + 12 focus = 108
        let ana = play(&server, &template, "ana", true, true).await;
        assert_eq!(ana["score"]["total"], 108);
        assert!(ana.get("settlements").is_none());

        // bo: 50 base + 10 speed + 7 focus = 67
        let bo = play(&server, &template, "bo", true, false).await;
        assert_eq!(bo["score"]["total"], 67);
        assert_eq!(bo["settlements"][0]["winner"], "ana");
        assert_eq!(bo["profile"]["total_xp"], 47);

        let settled = next_of_type(&mut ws, "duel_settled").await;
        assert_eq!(settled["duel"]["status"], "completed");
        assert_eq!(settled["duel"]["winner"], "ana");
        assert_eq!(settled["settlement"]["wager"], 20);

        let ana_profile = server.get("/api/profiles/ana").await;
        assert_eq!(ana_profile["total_xp"], 128);
        let bo_profile = server.get("/api/profiles/bo").await;
        assert_eq!(bo_profile["total_xp"], 47);
    })
    .await
    .expect("test timed out");
}

// ── REST guards ──────────────────────────────────────────────────────

#[tokio::test]
async fn only_the_opponent_can_answer_a_challenge() {
    let server = start_server().await;
    let template = create_template(&server).await;
    let duel_id = create_duel(&server, &template, 10).await;

    let (status, _) = server
        .post(&format!("/api/duels/{duel_id}/accept"), json!({ "user_id": "ana" }))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = server
        .post(&format!("/api/duels/{duel_id}/decline"), json!({ "user_id": "bo" }))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = server
        .post(&format!("/api/duels/{duel_id}/accept"), json!({ "user_id": "bo" }))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn invalid_duels_are_rejected() {
    let server = start_server().await;
    let template = create_template(&server).await;

    let (status, _) = server
        .post(
            "/api/duels",
            json!({ "template_id": template.id, "challenger": "ana", "opponent": "ana", "wager": 5 }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = server
        .post(
            "/api/duels",
            json!({ "template_id": template.id, "challenger": "ana", "opponent": "bo", "wager": 0 }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = server
        .post(
            "/api/duels",
            json!({ "template_id": Uuid::new_v4(), "challenger": "ana", "opponent": "bo", "wager": 5 }),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn racing_accept_and_decline_resolve_once() {
    let server = start_server().await;
    let template = create_template(&server).await;
    let duel_id = create_duel(&server, &template, 10).await;

    let accept_path = format!("/api/duels/{duel_id}/accept");
    let decline_path = format!("/api/duels/{duel_id}/decline");
    let ((a, _), (d, _)) = tokio::join!(
        server.post(&accept_path, json!({ "user_id": "bo" })),
        server.post(&decline_path, json!({ "user_id": "bo" })),
    );

    let ok = [a, d].iter().filter(|s| **s == StatusCode::OK).count();
    assert_eq!(ok, 1, "accept={a} decline={d}");
    assert!(a == StatusCode::CONFLICT || d == StatusCode::CONFLICT);

    let duels = server.get("/api/duels?user_id=bo").await;
    let status = duels[0]["status"].as_str().unwrap();
    assert!(status == "active" || status == "declined");
}
