use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::models::{HealthResponse, RewriteRequest, RewriteResponse};
use crate::relay::{CompletionClient, RelayError, TaskKind};

#[derive(Clone)]
pub struct AppState {
    pub completions: Arc<CompletionClient>,
}

impl AppState {
    pub fn new(completions: CompletionClient) -> Self {
        AppState {
            completions: Arc::new(completions),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/summarize", post(summarize))
        .route("/api/engagify", post(engagify))
        .route("/api/chat", post(chat))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        message: "Engagify backend is running",
        timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
    })
}

async fn summarize(
    state: State<AppState>,
    req: Result<Json<RewriteRequest>, JsonRejection>,
) -> Response {
    run_task(TaskKind::Summarize, state, req).await
}

async fn engagify(
    state: State<AppState>,
    req: Result<Json<RewriteRequest>, JsonRejection>,
) -> Response {
    run_task(TaskKind::Engagify, state, req).await
}

async fn chat(
    state: State<AppState>,
    req: Result<Json<RewriteRequest>, JsonRejection>,
) -> Response {
    run_task(TaskKind::Chat, state, req).await
}

async fn run_task(
    task: TaskKind,
    State(state): State<AppState>,
    req: Result<Json<RewriteRequest>, JsonRejection>,
) -> Response {
    let prompt = match req {
        Ok(Json(req)) => req.prompt,
        Err(rejection) => {
            tracing::debug!(error = %rejection, "unreadable request body");
            None
        }
    };
    let Some(prompt) = prompt.filter(|p| !p.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Prompt is required"})),
        )
            .into_response();
    };

    match state.completions.rewrite(task, &prompt).await {
        Ok(output) => (StatusCode::OK, Json(RewriteResponse::success(output))).into_response(),
        Err(e) => {
            let detail = match &e {
                RelayError::Upstream(body) => body.clone(),
                RelayError::Request(msg) => format!("Upstream request failed: {}", msg),
            };
            tracing::error!(task = task.endpoint(), error = %e, "completion failed");
            (StatusCode::BAD_GATEWAY, Json(RewriteResponse::failure(detail))).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use serde_json::Value;
    use tower::ServiceExt;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    fn state_for(url: &str) -> AppState {
        let config = RelayConfig::from_lookup(|key| match key {
            "OPENAI_API_KEY" => Some("sk-test".to_string()),
            "OPENAI_URL" => Some(url.to_string()),
            _ => None,
        })
        .unwrap();
        AppState::new(CompletionClient::new(&config).unwrap())
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn read_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn missing_prompt_is_rejected() {
        let router = app(state_for("http://127.0.0.1:9/unused"));
        for body in [r#"{}"#, r#"{"prompt":""}"#] {
            let response = router
                .clone()
                .oneshot(post_json("/api/summarize", body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(read_json(response).await, json!({"error": "Prompt is required"}));
        }
    }

    #[tokio::test]
    async fn unreadable_body_is_rejected_as_json() {
        let router = app(state_for("http://127.0.0.1:9/unused"));
        let untyped = Request::builder()
            .method("POST")
            .uri("/api/engagify")
            .body(Body::from(r#"{"prompt":"X"}"#))
            .unwrap();
        let requests = [
            untyped,
            post_json("/api/engagify", r#"{"prompt":"#),
            post_json("/api/chat", r#"{"prompt":42}"#),
        ];
        for request in requests {
            let response = router.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(read_json(response).await, json!({"error": "Prompt is required"}));
        }
    }

    #[tokio::test]
    async fn relays_completion_output() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::body_partial_json(json!({"max_tokens": 2500})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "<p>Y</p>"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = app(state_for(&server.uri()))
            .oneshot(post_json("/api/engagify", r#"{"prompt":"X"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_json(response).await, json!({"ok": true, "output": "<p>Y</p>"}));
    }

    #[tokio::test]
    async fn upstream_failure_maps_to_bad_gateway() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model overloaded"))
            .mount(&server)
            .await;

        let response = app(state_for(&server.uri()))
            .oneshot(post_json("/api/chat", r#"{"prompt":"why?"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            read_json(response).await,
            json!({"ok": false, "error": "model overloaded"})
        );
    }

    #[tokio::test]
    async fn health_reports_timestamp() {
        let response = app(state_for("http://127.0.0.1:9/unused"))
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["status"], "ok");
        let stamp = body["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
    }
}
