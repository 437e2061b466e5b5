//! Router-level tests: webhook ingress through the accumulator to the flush
//! callback, plus the operational endpoints.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use relay_agents::{flush_callback, AgentDirectory, MessageAccumulator};
use relay_api::{router, AppState};
use relay_cache::HistoryCache;
use relay_core::types::{AgentProfile, ChatTurn, InboundMessage};
use relay_core::RelayError;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tower::ServiceExt;

type Flushed = Arc<Mutex<Vec<(String, Vec<String>)>>>;

struct Harness {
    app: Router,
    accumulator: MessageAccumulator<InboundMessage>,
    history: Arc<HistoryCache>,
    flushed: Flushed,
}

fn profile(agent_id: &str, active: bool) -> AgentProfile {
    AgentProfile {
        agent_id: agent_id.to_string(),
        organization_id: "org-1".to_string(),
        name: "Ana".to_string(),
        organization_name: None,
        system_prompt: String::new(),
        instance: "sales".to_string(),
        model: None,
        window_ms: None,
        active,
    }
}

fn harness(webhook_token: Option<&str>) -> Harness {
    let directory = Arc::new(
        AgentDirectory::from_profiles(vec![profile("agent-1", true), profile("agent-off", false)])
            .unwrap(),
    );
    let history = Arc::new(HistoryCache::new(3600, 100, 10));
    let accumulator = MessageAccumulator::new(Duration::from_millis(100), None);
    let flushed: Flushed = Arc::new(Mutex::new(Vec::new()));

    let sink = flushed.clone();
    let on_flush = flush_callback(move |key: String, batch: Vec<InboundMessage>| {
        let sink = sink.clone();
        async move {
            let texts = batch.into_iter().map(|m| m.text).collect();
            sink.lock().unwrap().push((key, texts));
            Ok::<(), RelayError>(())
        }
    });

    let state = AppState {
        accumulator: accumulator.clone(),
        on_flush,
        directory,
        history: history.clone(),
        default_window: Duration::from_millis(1000),
        webhook_token: webhook_token.map(str::to_string),
        node_id: "relay-test".to_string(),
        start_time: Instant::now(),
    };

    Harness {
        app: router(state),
        accumulator,
        history,
        flushed,
    }
}

fn upsert(text: &str) -> Value {
    json!({
        "event": "messages.upsert",
        "instance": "sales",
        "data": {
            "key": {
                "remoteJid": "5511999990000@s.whatsapp.net",
                "fromMe": false,
                "id": "ABC123"
            },
            "pushName": "Maria",
            "message": { "conversation": text }
        }
    })
}

fn post_json(uri: &str, body: &Value, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("x-webhook-token", token);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

#[tokio::test(start_paused = true)]
async fn test_burst_is_buffered_and_flushed_once() {
    let h = harness(None);

    for text in ["oi", "tudo bem?", "quero alugar"] {
        let (status, body) = send(
            &h.app,
            post_json("/v1/agents/webhook/agent-1", &upsert(text), None),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "buffered");
        assert_eq!(body["key"], "org-1:agent-1:5511999990000");
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    let (status, body) = send(&h.app, request("GET", "/v1/accumulators")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["message_count"], 3);

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let flushed = h.flushed.lock().unwrap().clone();
    assert_eq!(
        flushed,
        vec![(
            "org-1:agent-1:5511999990000".to_string(),
            vec!["oi".to_string(), "tudo bem?".to_string(), "quero alugar".to_string()]
        )]
    );
    assert!(h.accumulator.is_empty());
}

#[tokio::test]
async fn test_webhook_token_enforced() {
    let h = harness(Some("s3cret"));

    let (status, _) = send(
        &h.app,
        post_json("/v1/agents/webhook/agent-1", &upsert("hi"), None),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &h.app,
        post_json("/v1/agents/webhook/agent-1", &upsert("hi"), Some("wrong")),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &h.app,
        post_json("/v1/agents/webhook/agent-1", &upsert("hi"), Some("s3cret")),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_unknown_and_inactive_agents() {
    let h = harness(None);

    let (status, body) = send(
        &h.app,
        post_json("/v1/agents/webhook/ghost", &upsert("hi"), None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "agent_not_found");

    let (status, _) = send(
        &h.app,
        post_json("/v1/agents/webhook/agent-off", &upsert("hi"), None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(h.accumulator.is_empty());
}

#[tokio::test]
async fn test_skipped_events_are_acknowledged() {
    let h = harness(None);

    let mut own = upsert("hi");
    own["data"]["key"]["fromMe"] = json!(true);
    let (status, body) = send(&h.app, post_json("/v1/agents/webhook/agent-1", &own, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");
    assert_eq!(body["reason"], "from_me");

    let presence = json!({ "event": "presence.update", "data": null });
    let (status, body) =
        send(&h.app, post_json("/v1/agents/webhook/agent-1", &presence, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reason"], "unsupported_event");
    assert!(h.accumulator.is_empty());
}

#[tokio::test]
async fn test_health_reports_buffers_and_cache() {
    let h = harness(None);
    send(
        &h.app,
        post_json("/v1/agents/webhook/agent-1", &upsert("hi"), None),
    )
    .await;

    let (status, body) = send(&h.app, request("GET", "/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["node_id"], "relay-test");
    assert_eq!(body["agents"], 2);
    assert_eq!(body["active_buffers"], 1);
    assert_eq!(body["accumulators"][0]["key"], "org-1:agent-1:5511999990000");
    assert_eq!(body["cache"]["entries"], 0);

    let (status, _) = send(&h.app, request("GET", "/ready")).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&h.app, request("GET", "/live")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_clear_endpoints() {
    let h = harness(None);
    let key = "org-1:agent-1:5511999990000";
    h.history
        .append(key, vec![ChatTurn::user("hi"), ChatTurn::assistant("hello")])
        .unwrap();
    send(
        &h.app,
        post_json("/v1/agents/webhook/agent-1", &upsert("again"), None),
    )
    .await;

    let (status, body) = send(&h.app, request("DELETE", &format!("/v1/cache/{key}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["history_cleared"], 1);
    assert_eq!(body["accumulator_cleared"], true);
    assert!(h.history.is_empty());
    assert!(h.accumulator.is_empty());

    let (status, _) = send(&h.app, request("DELETE", &format!("/v1/accumulators/{key}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&h.app, request("DELETE", "/v1/cache/not-a-key")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    h.history.append("org-1:agent-1:1", vec![ChatTurn::user("a")]).unwrap();
    h.history.append("org-1:agent-1:2", vec![ChatTurn::user("b")]).unwrap();
    let (status, body) = send(&h.app, request("DELETE", "/v1/cache")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["history_cleared"], 2);
}

#[tokio::test]
async fn test_agent_registry_endpoints() {
    let h = harness(None);

    let body = json!({
        "agent_id": "ignored",
        "organization_id": "org-2",
        "name": "Bia",
        "instance": "support",
        "window_ms": 5000
    });
    let req = Request::builder()
        .method("PUT")
        .uri("/v1/agents/agent-2")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, created) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["agent_id"], "agent-2");
    assert_eq!(created["active"], true);

    let bad = json!({
        "agent_id": "agent-3",
        "organization_id": "org-2",
        "name": "Bia",
        "instance": "",
    });
    let req = Request::builder()
        .method("PUT")
        .uri("/v1/agents/agent-3")
        .header("content-type", "application/json")
        .body(Body::from(bad.to_string()))
        .unwrap();
    let (status, _) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, agents) = send(&h.app, request("GET", "/v1/agents")).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = agents
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["agent_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["agent-1", "agent-2", "agent-off"]);
}
