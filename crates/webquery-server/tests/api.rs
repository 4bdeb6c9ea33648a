//! Router tests: drive the axum app in-process with fake browser and model
//! capabilities and check status codes and response shapes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use tower::ServiceExt;
use webquery_browser::{BrowserCapability, BrowserHandle, ExtractMode, Navigation};
use webquery_chat::{Completion, LLMConfig, ModelBackend, Prompt};
use webquery_core::{OrchestrationConfig, Result, WebQueryConfig};
use webquery_server::{build_router, AppState};

struct StaticWeb {
    sessions: AtomicUsize,
}

#[async_trait]
impl BrowserCapability for StaticWeb {
    async fn open_session(&self) -> Result<BrowserHandle> {
        let n = self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(BrowserHandle {
            remote_id: format!("s{}", n),
        })
    }

    async fn navigate(&self, _handle: &BrowserHandle, url: &str) -> Result<Navigation> {
        Ok(Navigation {
            page_id: "p1".into(),
            url: url.to_string(),
        })
    }

    async fn extract(&self, _handle: &BrowserHandle, _page_id: &str, _mode: &ExtractMode) -> Result<String> {
        Ok("Lima is the capital of Peru.".into())
    }

    async fn close_page(&self, _handle: &BrowserHandle, _page_id: &str) -> Result<()> {
        Ok(())
    }

    async fn close(&self, _handle: &BrowserHandle) -> Result<()> {
        Ok(())
    }

    async fn ping(&self) -> bool {
        true
    }
}

struct CannedModel;

#[async_trait]
impl ModelBackend for CannedModel {
    fn name(&self) -> &str {
        "canned"
    }

    fn model(&self) -> &str {
        "canned-1"
    }

    async fn complete(&self, _prompt: &Prompt) -> Result<Completion> {
        Ok(Completion {
            content: "Lima.".into(),
            tokens_used: Some(3),
        })
    }
}

fn app_with(dir: &tempfile::TempDir, backends: Vec<Arc<dyn ModelBackend>>) -> Router {
    let config = WebQueryConfig {
        port: 0,
        infrastructure_url: "http://127.0.0.1:1".into(),
        data_dir: dir.path().to_path_buf(),
        orchestration: OrchestrationConfig {
            session_pool_size: 2,
            ..Default::default()
        },
    };
    let llm = LLMConfig::load_with(&config.llm_config_file(), |_| None);
    let browser = Arc::new(StaticWeb {
        sessions: AtomicUsize::new(0),
    });
    build_router(Arc::new(AppState::from_parts(config, browser, backends, llm)))
}

fn app(dir: &tempfile::TempDir) -> Router {
    app_with(dir, vec![Arc::new(CannedModel) as Arc<dyn ModelBackend>])
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_shape() {
    let dir = tempfile::tempdir().unwrap();
    let resp = app(&dir).oneshot(get("/api/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let json = body_json(resp).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["service"], "webquery");
    assert!(json["version"].is_string());
    assert_eq!(json["infrastructure_reachable"], true);
    assert!(json["uptime_secs"].is_number());
    for key in json.as_object().unwrap().keys() {
        assert!(!key.chars().any(|c| c.is_ascii_uppercase()), "camelCase key {}", key);
    }
}

#[tokio::test]
async fn test_ready_requires_a_model_backend() {
    let dir = tempfile::tempdir().unwrap();
    let resp = app(&dir).oneshot(get("/api/ready")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app_with(&dir, Vec::new()).oneshot(get("/api/ready")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_json(resp).await;
    assert_eq!(json["ready"], false);
    assert_eq!(json["models"], false);
    assert_eq!(json["pool"], true);
}

#[tokio::test]
async fn test_stats_shape() {
    let dir = tempfile::tempdir().unwrap();
    let json = body_json(app(&dir).oneshot(get("/api/stats")).await.unwrap()).await;
    assert_eq!(json["pool"]["capacity"], 2);
    assert_eq!(json["pool"]["leased"], 0);
    assert_eq!(json["models"]["backends"][0], "canned");
    assert!(json["cache"]["entries"].is_number());
    assert!(json["cache"]["maxEntries"].is_number());
    assert!(json["cache"]["inFlight"].is_number());
    assert!(json["models"]["concurrencyLimit"].is_number());
    assert!(json["limits"]["planDeadlineMs"].is_number());
    assert_eq!(json["llm"]["preferredProvider"], "ollama");
}

#[tokio::test]
async fn test_query_returns_answer_and_steps() {
    let dir = tempfile::tempdir().unwrap();
    let resp = app(&dir)
        .oneshot(post_json(
            "/api/query",
            serde_json::json!({
                "query": "What is the capital of Peru?",
                "agentId": "agent-7",
                "sessionName": "research"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let json = body_json(resp).await;
    assert_eq!(json["status"], "completed");
    assert_eq!(json["success"], true);
    assert_eq!(json["answer"], "Lima.");
    assert_eq!(json["agentId"], "agent-7");
    assert_eq!(json["sessionName"], "research");
    assert!(json["queryId"].is_string());
    assert!(json["error"].is_null());

    let steps = json["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0]["kind"], "fetch");
    assert_eq!(steps[0]["status"], "succeeded");
    assert_eq!(steps[0]["output"]["pageId"], "p1");
    assert!(steps[0]["output"]["elapsedMs"].is_number());
    assert_eq!(steps[1]["kind"], "model-call");
    assert_eq!(steps[1]["output"]["content"], "Lima.");
}

#[tokio::test]
async fn test_unplannable_query_is_422() {
    let dir = tempfile::tempdir().unwrap();
    let resp = app(&dir)
        .oneshot(post_json("/api/query", serde_json::json!({ "query": "   " })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let json = body_json(resp).await;
    assert_eq!(json["kind"], "unplannable_query");
    assert!(json["error"].as_str().unwrap().contains("empty"));
}

#[tokio::test]
async fn test_plan_dry_run() {
    let dir = tempfile::tempdir().unwrap();
    let resp = app(&dir)
        .oneshot(post_json(
            "/api/plan",
            serde_json::json!({ "query": "Compare https://a.example/x with https://b.example/y" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let json = body_json(resp).await;
    let steps = json["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 3);
    assert_eq!(steps[0]["kind"], "fetch");
    assert_eq!(steps[2]["kind"], "model-call");
    assert_eq!(steps[2]["dependsOn"], serde_json::json!([0, 1]));
    assert!(json["deadlineMs"].is_number());
}

#[tokio::test]
async fn test_stream_emits_events_then_result() {
    let dir = tempfile::tempdir().unwrap();
    let resp = app(&dir)
        .oneshot(post_json(
            "/api/query/stream",
            serde_json::json!({ "query": "What is the capital of Peru?" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let content_type = resp.headers()[header::CONTENT_TYPE].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    let started = text.find("event: plan_started").unwrap();
    let finished = text.find("event: plan_finished").unwrap();
    let result = text.find("event: result").unwrap();
    assert!(started < finished && finished < result);
    assert!(text.contains("\"answer\":\"Lima.\""));
}

#[tokio::test]
async fn test_stream_rejects_unplannable_query_before_streaming() {
    let dir = tempfile::tempdir().unwrap();
    let resp = app(&dir)
        .oneshot(post_json("/api/query/stream", serde_json::json!({ "query": "" })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
}
