//! Client for the hosted chat-completion API.
//!
//! Each task has a fixed system prompt and sampling profile. The relay server
//! and any other caller go through [`CompletionClient::rewrite`].

use crate::config::RelayConfig;
use crate::models::{ChatMessage, ChatRequest, ChatResponse};

const SUMMARIZE_SYSTEM: &str = "Summarize webpage text accurately. Keep facts. Be concise.";
const ENGAGIFY_SYSTEM: &str = "Rewrite webpage content engagingly. Follow tone and color \
instructions exactly. Convert [IMAGE: desc | Context: context -> url] to <figure><img \
src=\"url\" alt=\"desc\"><figcaption>[caption based on context/desc]</figcaption></figure>. \
Convert [LINK: text -> url] to <a href=\"url\">text</a>. Convert [TABLE: ...] rows to a \
<table>. Keep ALL facts. Output ONLY HTML with tags: <h1> <h2> <h3> <p> <strong> <em> <ul> \
<li> <a> <img> <figure> <figcaption> <table>. NO code blocks, NO <style> tags.";
const CHAT_SYSTEM: &str = "You are a helpful assistant answering questions about an article. \
Be concise, friendly, and accurate. If the answer is not in the article, say so politely.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Summarize,
    Engagify,
    Chat,
}

impl TaskKind {
    /// Path segment under `/api/`.
    pub fn endpoint(self) -> &'static str {
        match self {
            TaskKind::Summarize => "summarize",
            TaskKind::Engagify => "engagify",
            TaskKind::Chat => "chat",
        }
    }

    pub fn temperature(self) -> f64 {
        match self {
            TaskKind::Summarize => 0.3,
            TaskKind::Engagify => 0.4,
            TaskKind::Chat => 0.5,
        }
    }

    pub fn max_tokens(self) -> u32 {
        match self {
            TaskKind::Summarize => 1200,
            TaskKind::Engagify => 2500,
            TaskKind::Chat => 300,
        }
    }

    pub fn system_prompt(self) -> &'static str {
        match self {
            TaskKind::Summarize => SUMMARIZE_SYSTEM,
            TaskKind::Engagify => ENGAGIFY_SYSTEM,
            TaskKind::Chat => CHAT_SYSTEM,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The completion API answered with a non-success status; carries its body.
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    Request(String),
}

#[derive(Debug, Clone)]
pub struct CompletionClient {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    model: String,
}

impl CompletionClient {
    pub fn new(config: &RelayConfig) -> Result<Self, RelayError> {
        // Both limits are opt-in; by default the call runs to completion.
        let mut builder = reqwest::ClientBuilder::new();
        if let Some(timeout) = config.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| RelayError::Request(e.to_string()))?;

        Ok(CompletionClient {
            client,
            api_key: config.api_key.clone(),
            endpoint: config.completion_url.clone(),
            model: config.model.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Run `prompt` through the completion API with the profile for `task`.
    ///
    /// A response without choices yields an empty string rather than an error.
    pub async fn rewrite(&self, task: TaskKind, prompt: &str) -> Result<String, RelayError> {
        let body = ChatRequest {
            model: &self.model,
            temperature: task.temperature(),
            max_tokens: task.max_tokens(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: task.system_prompt(),
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RelayError::Request(format!("TimeoutError: {}", e))
                } else if e.is_connect() {
                    RelayError::Request(format!("ConnectError: {}", e))
                } else {
                    RelayError::Request(format!("RequestError: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .map_err(|e| RelayError::Request(e.to_string()))?;
            tracing::warn!(task = task.endpoint(), %status, "completion API returned an error");
            return Err(RelayError::Upstream(text));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| RelayError::Request(e.to_string()))?;
        let output = parsed.into_output();
        tracing::debug!(task = task.endpoint(), chars = output.len(), "completion received");
        Ok(output)
    }
}
