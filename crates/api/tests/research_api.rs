//! HTTP-level integration tests for the research API and the SSE relay.

mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{body_json, body_text, build_test_app, get, get_as, post_json, send};
use quarry_core::jobs::{research_job_key, JobState};
use quarry_core::progress::ProgressUpdate;
use quarry_core::research::{RelatedItem, Source};
use quarry_db::models::research::{NewResearch, ResultPatch};
use quarry_db::queue::JobQueue;
use quarry_db::store::ResultStore;
use quarry_workflow::scripted::{text_run, ScriptedGeneration, ScriptedRun};

fn no_upstream() -> ScriptedGeneration {
    ScriptedGeneration::new(Vec::<ScriptedRun>::new())
}

async fn create(t: &common::TestApp, user: &str, question: &str) -> serde_json::Value {
    let response = post_json(
        &t.app,
        "/api/v1/research",
        user,
        serde_json::json!({ "question": question }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await["data"].clone()
}

// ---------------------------------------------------------------------------
// Health and middleware
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_store_and_queue() {
    let t = build_test_app(no_upstream());

    let json = body_json(get(&t.app, "/health").await).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["store_healthy"], true);
    assert_eq!(json["queue_healthy"], true);
    assert!(json["version"].is_string());

    t.queue.set_reachable(false);
    let json = body_json(get(&t.app, "/health").await).await;
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["queue_healthy"], false);
}

#[tokio::test]
async fn response_contains_x_request_id_header() {
    let t = build_test_app(no_upstream());
    let response = get(&t.app, "/health").await;

    let request_id = response
        .headers()
        .get("x-request-id")
        .expect("Response must contain an x-request-id header");
    assert_eq!(request_id.to_str().unwrap().len(), 36);
}

#[tokio::test]
async fn cors_preflight_allows_relay_headers() {
    let t = build_test_app(no_upstream());
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/api/v1/research")
        .header("origin", "http://localhost:5173")
        .header("access-control-request-method", "GET")
        .header("access-control-request-headers", "last-event-id")
        .body(Body::empty())
        .unwrap();
    let response = send(&t.app, request).await;

    let headers = response.headers();
    assert_eq!(
        headers["access-control-allow-origin"],
        "http://localhost:5173"
    );
    let allowed = headers["access-control-allow-headers"].to_str().unwrap();
    assert!(allowed.contains("last-event-id"));
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let t = build_test_app(no_upstream());
    let response = get(&t.app, "/this-route-does-not-exist").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_research_submits_keyed_job() {
    let t = build_test_app(no_upstream());
    let data = create(&t, "u1", "Q1").await;

    let research_id = data["research"]["id"].as_str().unwrap();
    assert_eq!(data["research"]["question"], "Q1");
    assert_eq!(data["research"]["user_id"], "u1");
    assert_eq!(data["result"]["version"], 1);
    assert_eq!(data["result"]["status"], "initializing");
    assert_eq!(data["job"]["key"], format!("research:{research_id}"));
    assert_eq!(data["job"]["state"], "waiting");

    let record = t
        .queue
        .get(&format!("research:{research_id}"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.payload.user_id, "u1");
    assert_eq!(record.payload.question.question, "Q1");
    assert_eq!(
        record.payload.result_id.to_string(),
        data["result"]["id"].as_str().unwrap()
    );
}

#[tokio::test]
async fn blank_question_is_rejected() {
    let t = build_test_app(no_upstream());
    let response = post_json(
        &t.app,
        "/api/v1/research",
        "u1",
        serde_json::json!({ "question": "   " }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "VALIDATION_ERROR");
    assert!(t.store.list_research(None, 20).await.unwrap().is_empty());
}

#[tokio::test]
async fn unreachable_queue_fails_without_creating_a_result() {
    let t = build_test_app(no_upstream());
    t.queue.set_reachable(false);

    let response = post_json(
        &t.app,
        "/api/v1/research",
        "u1",
        serde_json::json!({ "question": "Q1" }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["code"], "QUEUE_UNAVAILABLE");
    assert!(t.store.list_research(None, 20).await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Follow-ups
// ---------------------------------------------------------------------------

#[tokio::test]
async fn followup_creates_next_version_and_replaces_waiting_job() {
    let t = build_test_app(no_upstream());
    let data = create(&t, "u1", "Q1").await;
    let research_id = data["research"]["id"].as_str().unwrap();

    let response = post_json(
        &t.app,
        &format!("/api/v1/research/{research_id}/followups"),
        "u1",
        serde_json::json!({ "question": "And in 2030?" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let followup = body_json(response).await["data"].clone();
    assert_eq!(followup["result"]["version"], 2);

    let record = t
        .queue
        .get(&format!("research:{research_id}"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.payload.question.question, "And in 2030?");
    assert_eq!(
        record.payload.result_id.to_string(),
        followup["result"]["id"].as_str().unwrap()
    );

    let detail = body_json(get(&t.app, &format!("/api/v1/research/{research_id}")).await).await;
    assert_eq!(detail["data"]["results"].as_array().unwrap().len(), 2);
    // Neither version is complete: the newest is current.
    assert_eq!(detail["data"]["current_result"]["version"], 2);
}

#[tokio::test]
async fn followup_while_generating_conflicts_and_discards_version() {
    let t = build_test_app(no_upstream());
    let data = create(&t, "u1", "Q1").await;
    let research_id = data["research"]["id"].as_str().unwrap();
    t.queue
        .claim("w-1", Duration::from_secs(30))
        .await
        .unwrap()
        .expect("job should be claimable");

    let response = post_json(
        &t.app,
        &format!("/api/v1/research/{research_id}/followups"),
        "u1",
        serde_json::json!({ "question": "Again" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let detail = body_json(get(&t.app, &format!("/api/v1/research/{research_id}")).await).await;
    assert_eq!(detail["data"]["results"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn followup_for_unknown_research_is_404() {
    let t = build_test_app(no_upstream());
    let response = post_json(
        &t.app,
        &format!("/api/v1/research/{}/followups", uuid::Uuid::nil()),
        "u1",
        serde_json::json!({ "question": "Q" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_shows_only_the_callers_research() {
    let t = build_test_app(no_upstream());
    create(&t, "u1", "Q1").await;
    create(&t, "u2", "Q2").await;

    let json = body_json(get_as(&t.app, "/api/v1/research?limit=10", "u1").await).await;
    let items = json["data"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["question"], "Q1");
    assert_eq!(items[0]["current_result"]["version"], 1);
}

#[tokio::test]
async fn job_status_returns_queue_record() {
    let t = build_test_app(no_upstream());
    let data = create(&t, "u1", "Q1").await;
    let research_id = data["research"]["id"].as_str().unwrap();

    let response = get(&t.app, &format!("/api/v1/research/{research_id}/job")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["state"], "waiting");
    assert_eq!(json["data"]["attempts_made"], 0);
    assert_eq!(json["data"]["max_attempts"], 3);
    assert_eq!(json["data"]["payload"]["userId"], "u1");
}

#[tokio::test]
async fn job_status_of_unknown_research_is_404() {
    let t = build_test_app(no_upstream());
    let response = get(&t.app, &format!("/api/v1/research/{}/job", uuid::Uuid::nil())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "NOT_FOUND");
}

#[tokio::test]
async fn sources_and_related_come_from_the_current_result() {
    let t = build_test_app(no_upstream());
    let (research, result) = t
        .store
        .create_research(NewResearch {
            question: "Q1".into(),
            user_id: Some("u1".into()),
        })
        .await
        .unwrap();

    let response = get(&t.app, &format!("/api/v1/research/{}/sources", research.id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"], serde_json::json!([]));

    t.store
        .record(
            result.id,
            ResultPatch {
                sources: Some(vec![Source {
                    id: "s1".into(),
                    source_id: "src-1".into(),
                    title: "Paper".into(),
                    url: "https://example.org/paper".into(),
                    source: "web".into(),
                }]),
                related: Some(vec![RelatedItem {
                    id: "r1".into(),
                    title: "Survey".into(),
                    url: "https://example.org/survey".into(),
                    date: None,
                    description: None,
                }]),
                ..ResultPatch::default()
            },
            &[],
        )
        .await
        .unwrap();

    let path = format!("/api/v1/research/{}/sources", research.id);
    let json = body_json(get(&t.app, &path).await).await;
    assert_eq!(json["data"][0]["sourceId"], "src-1");
    assert_eq!(json["data"][0]["url"], "https://example.org/paper");

    let path = format!("/api/v1/research/{}/related", research.id);
    let json = body_json(get(&t.app, &path).await).await;
    assert_eq!(json["data"].as_array().unwrap().len(), 1);
    assert_eq!(json["data"][0]["title"], "Survey");
}

#[tokio::test]
async fn sources_of_unknown_research_is_404() {
    let t = build_test_app(no_upstream());
    for path in ["sources", "related"] {
        let response = get(
            &t.app,
            &format!("/api/v1/research/{}/{path}", uuid::Uuid::nil()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

// ---------------------------------------------------------------------------
// Stream relay
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stream_of_complete_result_sends_snapshot_and_closes() {
    let t = build_test_app(no_upstream());
    let (research, result) = t
        .store
        .create_research(NewResearch {
            question: "Q1".into(),
            user_id: Some("u1".into()),
        })
        .await
        .unwrap();
    t.store
        .record(
            result.id,
            ResultPatch {
                markdown_content: Some("# Q1\n\nDone".into()),
                status: Some("completed".into()),
                is_complete: Some(true),
                progress: Some(100),
                ..ResultPatch::default()
            },
            &[ProgressUpdate::Completed],
        )
        .await
        .unwrap();

    let response = get(&t.app, &format!("/api/v1/research/{}/stream", research.id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let body = body_text(response).await;
    let connected = body.find("event: connected").unwrap();
    let content = body.find("event: content").unwrap();
    let complete = body.find("event: complete").unwrap();
    assert!(connected < content && content < complete);
    assert!(body.contains(&result.id.to_string()));
}

#[tokio::test]
async fn live_stream_generates_the_result() {
    let t = build_test_app(ScriptedGeneration::new([text_run(&["A", "B", "C"])]));
    let (research, result) = t
        .store
        .create_research(NewResearch {
            question: "Q1".into(),
            user_id: Some("u1".into()),
        })
        .await
        .unwrap();

    let response = get(
        &t.app,
        &format!("/api/v1/research/{}/stream?mode=live", research.id),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = tokio::time::timeout(Duration::from_secs(10), body_text(response))
        .await
        .expect("live stream should finish");
    assert!(body.contains("event: start"));
    assert!(body.contains("event: complete"));

    assert_eq!(t.service.calls(), 1);
    let stored = t.store.get(result.id).await.unwrap();
    assert!(stored.is_complete);
    assert!(stored.markdown_content.ends_with("ABC"));

    let job = t
        .queue
        .get(&research_job_key(research.id))
        .await
        .unwrap()
        .expect("live run goes through the queue");
    assert_eq!(job.state, JobState::Completed);
}

#[tokio::test]
async fn stream_rejects_invalid_last_event_id() {
    let t = build_test_app(no_upstream());
    let data = create(&t, "u1", "Q1").await;
    let research_id = data["research"]["id"].as_str().unwrap();

    let request = Request::get(format!("/api/v1/research/{research_id}/stream"))
        .header("last-event-id", "abc")
        .body(Body::empty())
        .unwrap();
    let response = send(&t.app, request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stream_of_unknown_result_is_404() {
    let t = build_test_app(no_upstream());
    let data = create(&t, "u1", "Q1").await;
    let research_id = data["research"]["id"].as_str().unwrap();

    let response = get(
        &t.app,
        &format!(
            "/api/v1/research/{research_id}/stream?result_id={}",
            uuid::Uuid::nil()
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
