//! Page-side actions: extract, ask the relay, and show the result.

use scraper::Html;
use url::Url;

use crate::config::{ConfigError, Options, OptionsStore, SumMode, Tone};
use crate::extract::{extract, is_viable, ExtractOptions};
use crate::messaging::{MessageBus, RuntimeMessage, TabMessage};
use crate::page::{PageError, PageView};
use crate::relay::TaskKind;
use crate::render::{escape_text, render, RenderedFragment};
use crate::theme::{PageColors, ThemeColors};

/// Rendered output shorter than this (visible characters) is treated as unusable.
const MIN_RENDERED_LEN: usize = 20;

const FORMAT_INSTRUCTIONS: &str = "Make it visually appealing with proper formatting: use bold \
text for key points, headings for sections, and emphasis for important information. Keep the \
original information but make it easier to read and more engaging. Use HTML tags like <h1>, \
<h2>, <h3>, <p>, <strong>, <em>, <ul>, <li>. Avoid emojis. Keep every [LINK: ...], \
[IMAGE: ...], [TABLE: ...] and [CHART: ...] marker where it belongs.";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Not enough readable text found on this page.")]
    InsufficientContent,
    #[error("{0}")]
    Upstream(String),
    #[error("The response could not be displayed.")]
    MalformedOutput,
    #[error("Please enter a question.")]
    EmptyQuestion,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Page(#[from] PageError),
}

/// A summary as shown in the sidebar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Summary {
    Bullets(Vec<String>),
    Text(String),
}

impl Summary {
    /// Bullet output (leading `- ` or any `\n- `) becomes a list, the rest plain text.
    pub fn parse(output: &str) -> Self {
        let out = output.trim();
        if out.starts_with("- ") || out.contains("\n- ") {
            let items = out
                .lines()
                .map(|line| line.trim_start_matches('-').trim().to_string())
                .filter(|line| !line.is_empty())
                .collect();
            Summary::Bullets(items)
        } else {
            Summary::Text(out.to_string())
        }
    }

    /// Escaped markup for display; the model's text is never treated as HTML.
    pub fn to_html(&self) -> String {
        let mut html = String::new();
        match self {
            Summary::Bullets(items) => {
                html.push_str("<ul>");
                for item in items {
                    html.push_str("<li>");
                    escape_text(item, &mut html);
                    html.push_str("</li>");
                }
                html.push_str("</ul>");
            }
            Summary::Text(text) => {
                html.push_str("<p>");
                escape_text(text, &mut html);
                html.push_str("</p>");
            }
        }
        html
    }
}

/// Result of a popup command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Summarized(Summary),
    Rewritten,
    /// Whether there was a rewrite to undo.
    Restored(bool),
}

// ── Prompts ──────────────────────────────────────────────────────────────────

fn wrap_text(text: &str) -> String {
    format!("Text START<<{}>>Text END", text)
}

pub fn summary_prompt(options: &Options, text: &str) -> String {
    let instruction = match options.sum_mode {
        SumMode::Bullets => format!("Summarize into {} bullet points.", options.sum_count),
        SumMode::Sentences => format!("Summarize in {} concise sentences.", options.sum_count),
    };
    format!(
        "You are summarizing a webpage. {}\nKeep facts accurate and neutral. {}",
        instruction,
        wrap_text(text)
    )
}

pub fn engagify_prompt(tone: Tone, text: &str) -> String {
    let tone_prompt = match tone {
        Tone::Concise => {
            "Rewrite the following webpage content in a CONCISE, direct tone. Be brief and to \
             the point. Use short sentences and bullet points. Focus on key facts and essential \
             information only."
        }
        Tone::Conversational => {
            "Rewrite the following webpage content in a CONVERSATIONAL, friendly tone. Use \
             \"you\" and \"we\" language. Make it feel like a conversation with the reader. Be \
             engaging and approachable."
        }
        Tone::Academic => {
            "Rewrite the following webpage content in an ACADEMIC, formal tone. Use precise \
             language and technical terms. Structure information logically with clear \
             arguments and evidence."
        }
    };
    format!("{} {} {}", tone_prompt, FORMAT_INSTRUCTIONS, wrap_text(text))
}

pub fn chat_prompt(article: &str, question: &str) -> String {
    format!(
        "Answer the question using the article below.\n{}\nQuestion: {}",
        wrap_text(article),
        question
    )
}

// ── Content script ───────────────────────────────────────────────────────────

/// One page plus the collaborators an action needs.
///
/// Actions run one at a time: each takes `&mut self` for its whole duration.
pub struct ContentScript<B, S> {
    document: Html,
    view: PageView,
    base_url: Option<Url>,
    bus: B,
    store: S,
}

impl<B: MessageBus, S: OptionsStore> ContentScript<B, S> {
    pub fn new(document: Html, bus: B, store: S) -> Self {
        ContentScript {
            document,
            view: PageView::default(),
            base_url: None,
            bus,
            store,
        }
    }

    /// Resolve relative link and image URLs against the page address.
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    pub fn document(&self) -> &Html {
        &self.document
    }

    pub fn view(&self) -> &PageView {
        &self.view
    }

    pub async fn handle(&mut self, message: TabMessage) -> Result<ActionOutcome, PipelineError> {
        match message {
            TabMessage::Summarize => self.summarize().await.map(ActionOutcome::Summarized),
            TabMessage::Engagify => self.engagify().await.map(|_| ActionOutcome::Rewritten),
            TabMessage::Restore => Ok(ActionOutcome::Restored(self.restore())),
        }
    }

    pub async fn summarize(&mut self) -> Result<Summary, PipelineError> {
        let options = self.store.load()?;
        let text = self.extract_text(ExtractOptions::content(options.eng_max_chars))?;
        let output = self
            .request(TaskKind::Summarize, summary_prompt(&options, &text))
            .await?;
        if output.trim().is_empty() {
            return Err(PipelineError::MalformedOutput);
        }
        Ok(Summary::parse(&output))
    }

    /// Rewrite the main content in place. Any earlier rewrite is undone first so
    /// the model sees the page's own text, and shown again if this one fails.
    pub async fn engagify(&mut self) -> Result<RenderedFragment, PipelineError> {
        let options = self.store.load()?;
        let had_rewrite = self.view.restore(&mut self.document);
        let result = self.rewrite_original(&options).await;
        if result.is_err() && had_rewrite {
            self.view.show(&mut self.document);
        }
        result
    }

    async fn rewrite_original(
        &mut self,
        options: &Options,
    ) -> Result<RenderedFragment, PipelineError> {
        let text = self.extract_text(ExtractOptions::full_page(options.eng_max_chars))?;
        let output = self
            .request(TaskKind::Engagify, engagify_prompt(options.tone, &text))
            .await?;

        let theme = ThemeColors::for_page(&PageColors::from_document(&self.document));
        let fragment = render(&output, &theme);
        if fragment.text_len < MIN_RENDERED_LEN {
            tracing::warn!(chars = fragment.text_len, "rewrite output too short to show");
            return Err(PipelineError::MalformedOutput);
        }
        self.view.rewrite(&mut self.document, &fragment)?;
        Ok(fragment)
    }

    pub fn restore(&mut self) -> bool {
        self.view.restore(&mut self.document)
    }

    /// Flip between the original and the rewritten page.
    pub fn toggle(&mut self) -> bool {
        self.view.toggle(&mut self.document)
    }

    pub async fn ask(&mut self, question: &str) -> Result<String, PipelineError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(PipelineError::EmptyQuestion);
        }
        let options = self.store.load()?;
        let article = self.extract_text(ExtractOptions::content(options.eng_max_chars))?;
        let answer = self
            .request(TaskKind::Chat, chat_prompt(&article, question))
            .await?;
        Ok(answer.trim().to_string())
    }

    fn extract_text(&mut self, options: ExtractOptions) -> Result<String, PipelineError> {
        let options = match &self.base_url {
            Some(base) => options.with_base_url(base.clone()),
            None => options,
        };
        let text = extract(&mut self.document, &options);
        tracing::debug!(chars = text.chars().count(), mode = ?options.mode, "extracted page text");
        if !is_viable(&text) {
            return Err(PipelineError::InsufficientContent);
        }
        Ok(text)
    }

    async fn request(&self, task: TaskKind, prompt: String) -> Result<String, PipelineError> {
        let response = self.bus.send(RuntimeMessage::new(task, prompt)).await;
        if !response.ok {
            let error = response.error.unwrap_or_else(|| "Unknown error".to_string());
            tracing::warn!(task = task.endpoint(), %error, "action failed");
            return Err(PipelineError::Upstream(error));
        }
        Ok(response.output.unwrap_or_default())
    }
}
