//! HTTP routes and handlers

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use errlens_core::{DetectionResult, Error};
use errlens_detector::{EngineStats, ReloadOutcome};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/v1/detect", post(detect))
        .route("/v1/rules/reload", post(reload_rules))
        .route("/v1/rules/stats", get(rule_stats))
        .fallback(fallback)
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn metrics(State(state): State<AppState>) -> String {
    state.metrics_handle.render()
}

/// Detection request body
#[derive(Debug, Deserialize)]
struct DetectRequest {
    #[serde(default)]
    message: Option<String>,
    /// Wait for the first rule load instead of answering "not matched"
    #[serde(default = "default_wait")]
    wait: bool,
}

fn default_wait() -> bool {
    true
}

async fn detect(
    State(state): State<AppState>,
    Json(req): Json<DetectRequest>,
) -> Json<DetectionResult> {
    metrics::counter!("errlens_requests_total", "route" => "detect").increment(1);

    let message = req.message.as_deref();
    let result = if req.wait {
        state.engine.detect(message).await
    } else {
        state.engine.detect_now(message)
    };

    if result.matched {
        debug!(
            "Message classified as {}",
            result.category.as_deref().unwrap_or_default()
        );
    }
    Json(result)
}

async fn reload_rules(State(state): State<AppState>) -> Result<Json<ReloadOutcome>, AppError> {
    metrics::counter!("errlens_requests_total", "route" => "reload").increment(1);

    let outcome = state.engine.reload().await?;
    match &outcome {
        ReloadOutcome::Completed(report) => {
            info!("Manual rule reload installed {} rules", report.total())
        }
        ReloadOutcome::Skipped => info!("Manual rule reload skipped, one is already running"),
    }
    Ok(Json(outcome))
}

async fn rule_stats(State(state): State<AppState>) -> Json<EngineStats> {
    Json(state.engine.stats())
}

async fn fallback() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not found")
}

/// Error handling
#[derive(Debug)]
enum AppError {
    StoreUnavailable(String),
    InternalError(String),
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        match err {
            Error::Store(store) => AppError::StoreUnavailable(store.to_string()),
            other => AppError::InternalError(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            AppError::StoreUnavailable(msg) => {
                warn!("Rule store unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg)
            }
            AppError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
        };

        let body = json!({
            "error": {
                "message": message,
                "type": kind,
            }
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use errlens_core::{Rule, StoreError};
    use errlens_detector::DetectionEngine;
    use errlens_store::MemoryRuleStore;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_app(store: Arc<MemoryRuleStore>) -> (Router, Arc<DetectionEngine>) {
        let engine = Arc::new(DetectionEngine::new(store));
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let router = create_router(AppState::new(engine.clone(), handle));
        (router, engine)
    }

    fn sample_store() -> Arc<MemoryRuleStore> {
        Arc::new(MemoryRuleStore::new(vec![
            Rule::contains("connection refused", "network"),
            Rule::exact("out of memory", "resources"),
        ]))
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, body)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (router, _) = test_app(sample_store());
        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_detect_loads_and_matches() {
        let store = sample_store();
        let (router, _) = test_app(store.clone());

        let (status, body) = send(
            router,
            post_json("/v1/detect", json!({ "message": "dial tcp: connection refused" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["matched"], json!(true));
        assert_eq!(body["category"], json!("network"));
        assert_eq!(body["match_type"], json!("contains"));
        assert_eq!(store.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_detect_without_message_is_not_matched() {
        let store = sample_store();
        let (router, _) = test_app(store.clone());

        let (status, body) = send(router, post_json("/v1/detect", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "matched": false }));
        assert_eq!(store.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_detect_no_wait_before_load() {
        let (router, _) = test_app(sample_store());

        let (_, body) = send(
            router,
            post_json("/v1/detect", json!({ "message": "out of memory", "wait": false })),
        )
        .await;
        assert_eq!(body["matched"], json!(false));
    }

    #[tokio::test]
    async fn test_reload_and_stats() {
        let (router, _) = test_app(sample_store());

        let (status, body) = send(
            router.clone(),
            Request::post("/v1/rules/reload").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("completed"));
        assert_eq!(body["contains"], json!(1));
        assert_eq!(body["exact"], json!(1));

        let (status, body) = send(
            router,
            Request::get("/v1/rules/stats").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_count"], json!(2));
        assert_eq!(body["initialized"], json!(true));
        assert_eq!(body["is_reloading"], json!(false));
    }

    #[tokio::test]
    async fn test_reload_store_failure_is_503() {
        let store = sample_store();
        store.fail_with(Some(StoreError::Unavailable("connection reset".into())));
        let (router, engine) = test_app(store);

        let (status, body) = send(
            router,
            Request::post("/v1/rules/reload").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["type"], json!("store_unavailable"));
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (router, _) = test_app(sample_store());
        let response = router
            .oneshot(Request::get("/v1/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
