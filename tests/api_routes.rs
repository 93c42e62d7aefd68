//! In-process tests of the HTTP API through `tower::ServiceExt::oneshot`.


use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use health_orchestrator::api::{create_api_router, AppState};
use health_orchestrator::monitoring::{
    ApiTrafficStats, Orchestrator, PerformanceMonitor, PerformanceThresholds, ProbeRegistry,
    ReportGenerator,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use test_helpers::{static_probe, RecordingExecutor};
use tower::ServiceExt;

struct TestApp {
    state: AppState,
    _reports: TempDir,
}

impl TestApp {
    fn new() -> Self {
        let mut registry = ProbeRegistry::new();
        registry
            .register("database", static_probe(10, 10))
            .register("queue", static_probe(3, 10));
        let orchestrator = Arc::new(
            Orchestrator::builder(registry)
                .action_executor(Arc::new(RecordingExecutor::default()))
                .build()
                .unwrap(),
        );
        let traffic = Arc::new(ApiTrafficStats::new());
        let reports = TempDir::new().unwrap();
        let state = AppState {
            performance: Arc::new(PerformanceMonitor::new(
                orchestrator.clone(),
                traffic.clone(),
                PerformanceThresholds::default(),
            )),
            reports: Arc::new(ReportGenerator::new(orchestrator.store(), reports.path())),
            scheduler: None,
            orchestrator,
            traffic,
        };
        Self {
            state,
            _reports: reports,
        }
    }

    fn router(&self) -> Router {
        create_api_router(self.state.clone())
    }

    async fn send(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = self.router().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }
}

fn rule_body(id: &str, module: &str) -> Value {
    json!({
        "id": id,
        "module": module,
        "condition": {"type": "score_below", "threshold": 50},
        "actions": ["flush-queue"],
        "cooldown_seconds": 300
    })
}

#[tokio::test]
async fn service_health_endpoint_responds() {
    let app = TestApp::new();
    let (status, body) = app.send("GET", "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn run_then_summary_and_history() {
    let app = TestApp::new();

    let (status, run) = app.send("POST", "/api/health-check/run", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["overall_score"], 65);
    assert_eq!(run["overall"], "UNHEALTHY");

    let (status, summary) = app.send("GET", "/api/health-check/summary", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["modules"].as_array().unwrap().len(), 2);

    let (_, history) = app
        .send("GET", "/api/health-check/history/queue?limit=5", None)
        .await;
    assert_eq!(history.as_array().unwrap().len(), 1);
    assert_eq!(history[0]["score"], 30);

    let (status, _) = app
        .send("GET", "/api/health-check/history?limit=0", None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_module_is_a_bad_request() {
    let app = TestApp::new();
    let (status, body) = app
        .send("POST", "/api/health-check/run/payments", None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("payments"));

    let (status, _) = app
        .send("GET", "/api/health-check/history/payments", None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn remediation_rule_lifecycle() {
    let app = TestApp::new();
    let base = "/api/health-check/remediation/rules";

    let (status, created) = app
        .send("POST", base, Some(rule_body("flush", "queue")))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["enabled"], true);

    let (status, _) = app
        .send("POST", base, Some(rule_body("flush", "queue")))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .send("POST", base, Some(rule_body("other", "payments")))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, toggled) = app
        .send("PATCH", &format!("{base}/flush/toggle"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(toggled["enabled"], false);

    let (status, _) = app
        .send("PUT", &format!("{base}/missing"), Some(rule_body("missing", "queue")))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, rules) = app.send("GET", base, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rules.as_array().unwrap().len(), 1);

    let (status, _) = app.send("DELETE", &format!("{base}/flush"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = app.send("DELETE", &format!("{base}/flush"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn remediation_logs_follow_a_run() {
    let app = TestApp::new();
    app.send(
        "POST",
        "/api/health-check/remediation/rules",
        Some(rule_body("flush", "queue")),
    )
    .await;
    app.send("POST", "/api/health-check/run", None).await;

    let (status, logs) = app
        .send("GET", "/api/health-check/remediation/logs?module=queue", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(logs.as_array().unwrap().len(), 1);
    assert_eq!(logs[0]["health_score_before"], 30);

    let (_, none) = app
        .send("GET", "/api/health-check/remediation/logs?module=database", None)
        .await;
    assert!(none.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn schedule_updates_are_validated() {
    let app = TestApp::new();

    let (status, _) = app
        .send("PUT", "/api/health-check/schedule", Some(json!({"interval_seconds": 5})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, schedule) = app
        .send(
            "PUT",
            "/api/health-check/schedule",
            Some(json!({"enabled": false, "interval_seconds": 600})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(schedule["enabled"], false);
    assert_eq!(schedule["interval_seconds"], 600);

    let (_, current) = app.send("GET", "/api/health-check/schedule", None).await;
    assert_eq!(current["enabled"], false);
}

#[tokio::test]
async fn reports_are_generated_and_listed() {
    let app = TestApp::new();
    app.send("POST", "/api/health-check/run", None).await;

    let start = chrono::Utc::now() - chrono::Duration::hours(1);
    let end = chrono::Utc::now() + chrono::Duration::minutes(1);

    let (status, _) = app
        .send(
            "POST",
            "/api/health-check/reports",
            Some(json!({"start": end, "end": start})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, report) = app
        .send(
            "POST",
            "/api/health-check/reports",
            Some(json!({"start": start, "end": end, "format": "csv"})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(report["stats"]["total"], 2);
    assert!(report["file_name"].as_str().unwrap().ends_with(".csv"));

    let (_, listed) = app.send("GET", "/api/health-check/reports", None).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn metrics_and_performance_endpoints() {
    let app = TestApp::new();
    app.send("POST", "/api/health-check/run", None).await;

    let response = app
        .router()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(text.to_vec()).unwrap();
    assert!(text.contains("health_check_runs_total"));

    let (status, sample) = app.send("GET", "/api/health-check/performance", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sample["metrics"]["modules_registered"], 2);
    assert!(sample["requests_per_minute"].as_f64().unwrap() >= 1.0);

    let (status, history) = app
        .send("GET", "/api/health-check/performance/history", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(history.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn report_without_dates_covers_the_last_week() {
    let app = TestApp::new();
    app.send("POST", "/api/health-check/run", None).await;

    let (status, report) = app
        .send("POST", "/api/health-check/reports", Some(json!({"format": "txt"})))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(report["stats"]["total"], 2);
    assert!(report["file_name"].as_str().unwrap().ends_with(".txt"));
}
