//! Message types exchanged between the page, the background worker and the relay.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::RewriteRequest;
use crate::relay::TaskKind;

pub use crate::models::RewriteResponse as MessageResponse;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:3000";

/// Requests sent from a page to the background worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RuntimeMessage {
    #[serde(rename = "OPENAI_SUMMARIZE")]
    Summarize { prompt: String },
    #[serde(rename = "OPENAI_ENGAGIFY")]
    Engagify { prompt: String },
    #[serde(rename = "OPENAI_CHAT")]
    Chat { prompt: String },
}

impl RuntimeMessage {
    pub fn new(task: TaskKind, prompt: String) -> Self {
        match task {
            TaskKind::Summarize => RuntimeMessage::Summarize { prompt },
            TaskKind::Engagify => RuntimeMessage::Engagify { prompt },
            TaskKind::Chat => RuntimeMessage::Chat { prompt },
        }
    }

    pub fn task(&self) -> TaskKind {
        match self {
            RuntimeMessage::Summarize { .. } => TaskKind::Summarize,
            RuntimeMessage::Engagify { .. } => TaskKind::Engagify,
            RuntimeMessage::Chat { .. } => TaskKind::Chat,
        }
    }

    pub fn prompt(&self) -> &str {
        match self {
            RuntimeMessage::Summarize { prompt }
            | RuntimeMessage::Engagify { prompt }
            | RuntimeMessage::Chat { prompt } => prompt,
        }
    }
}

/// Commands sent from the toolbar popup to the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "UPPERCASE")]
pub enum TabMessage {
    Summarize,
    Engagify,
    Restore,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Deliver `message` and wait for the single response. Never fails; errors
    /// come back as `{ok: false, error}`.
    async fn send(&self, message: RuntimeMessage) -> MessageResponse;
}

#[async_trait]
impl<T: MessageBus + ?Sized> MessageBus for std::sync::Arc<T> {
    async fn send(&self, message: RuntimeMessage) -> MessageResponse {
        (**self).send(message).await
    }
}

/// Forwards runtime messages to the relay server over HTTP.
#[derive(Debug, Clone)]
pub struct BackgroundRouter {
    client: reqwest::Client,
    backend_url: String,
}

impl BackgroundRouter {
    pub fn new(backend_url: impl Into<String>) -> Self {
        BackgroundRouter {
            client: reqwest::Client::new(),
            backend_url: backend_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn call_backend(&self, task: TaskKind, prompt: &str) -> Result<String, String> {
        let url = format!("{}/api/{}", self.backend_url, task.endpoint());
        let response = self
            .client
            .post(&url)
            .json(&RewriteRequest {
                prompt: Some(prompt.to_string()),
            })
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            let text = response.text().await.map_err(|e| e.to_string())?;
            return Err(format!("Backend error: {}", text));
        }

        let body: MessageResponse = response.json().await.map_err(|e| e.to_string())?;
        if !body.ok {
            return Err(body
                .error
                .unwrap_or_else(|| "Backend processing failed".to_string()));
        }
        Ok(body.output.unwrap_or_default())
    }
}

impl Default for BackgroundRouter {
    fn default() -> Self {
        BackgroundRouter::new(DEFAULT_BACKEND_URL)
    }
}

#[async_trait]
impl MessageBus for BackgroundRouter {
    async fn send(&self, message: RuntimeMessage) -> MessageResponse {
        let task = message.task();
        match self.call_backend(task, message.prompt()).await {
            Ok(output) => MessageResponse::success(output),
            Err(e) => {
                tracing::warn!(task = task.endpoint(), error = %e, "backend call failed");
                MessageResponse::failure(format!(
                    "Failed to connect to backend server. Make sure it's running on {}. Error: {}",
                    self.backend_url, e
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    #[test]
    fn runtime_message_wire_format() {
        let msg = RuntimeMessage::new(TaskKind::Chat, "hi".to_string());
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "OPENAI_CHAT", "prompt": "hi"})
        );
        let parsed: RuntimeMessage =
            serde_json::from_str(r#"{"type":"OPENAI_ENGAGIFY","prompt":"p"}"#).unwrap();
        assert_eq!(parsed.task(), TaskKind::Engagify);
        assert_eq!(parsed.prompt(), "p");
    }

    #[test]
    fn tab_message_wire_format() {
        let parsed: TabMessage = serde_json::from_str(r#"{"action":"RESTORE"}"#).unwrap();
        assert_eq!(parsed, TabMessage::Restore);
        assert_eq!(
            serde_json::to_value(TabMessage::Summarize).unwrap(),
            json!({"action": "SUMMARIZE"})
        );
    }

    #[test]
    fn response_omits_absent_fields() {
        assert_eq!(
            serde_json::to_value(MessageResponse::failure("boom")).unwrap(),
            json!({"ok": false, "error": "boom"})
        );
    }

    #[tokio::test]
    async fn forwards_to_matching_endpoint() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/api/summarize"))
            .and(matchers::body_json(json!({"prompt": "X"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true, "output": "Y"})))
            .expect(1)
            .mount(&server)
            .await;

        let router = BackgroundRouter::new(format!("{}/", server.uri()));
        let res = router
            .send(RuntimeMessage::new(TaskKind::Summarize, "X".to_string()))
            .await;
        assert_eq!(res, MessageResponse::success("Y".to_string()));
    }

    #[tokio::test]
    async fn backend_errors_are_wrapped() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(
                ResponseTemplate::new(502).set_body_string(r#"{"ok":false,"error":"quota"}"#),
            )
            .mount(&server)
            .await;

        let router = BackgroundRouter::new(server.uri());
        let res = router
            .send(RuntimeMessage::new(TaskKind::Engagify, "X".to_string()))
            .await;
        assert!(!res.ok);
        let error = res.error.unwrap();
        assert!(error.starts_with("Failed to connect to backend server."));
        assert!(error.contains(&server.uri()));
        assert!(error.ends_with(r#"Error: Backend error: {"ok":false,"error":"quota"}"#));
    }

    #[tokio::test]
    async fn not_ok_body_uses_its_error() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": false})))
            .mount(&server)
            .await;

        let res = BackgroundRouter::new(server.uri())
            .send(RuntimeMessage::new(TaskKind::Chat, "q".to_string()))
            .await;
        assert!(res.error.unwrap().ends_with("Error: Backend processing failed"));
    }
}
