//! Streaming answer generation.
//!
//! [`ResponseGenerator`] turns a conversation plus retrieved context into a
//! stream of text deltas. [`OpenAiGenerator`] talks to any OpenAI-compatible
//! `/v1/chat/completions` endpoint with `stream: true` and forwards the
//! `data:` server-sent events through a channel.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::GenerationConfig;
use crate::models::{PromptMessage, SearchHit};

pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are the assistant for a personal blog and knowledge base. \
Answer using the provided context. If the context does not cover the question, say so briefly. \
When you refer to a post, mention its slug.";

/// Buffered deltas between the generator task and the HTTP response.
const CHANNEL_CAPACITY: usize = 64;

#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Starts generating a reply. Deltas arrive on the returned channel,
    /// which closes when the reply is complete.
    async fn stream_reply(
        &self,
        messages: &[PromptMessage],
        context: &[SearchHit],
    ) -> Result<mpsc::Receiver<Result<String>>>;
}

/// Renders retrieved chunks into the block appended to the system prompt.
pub fn build_context(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return "No relevant context was found.".to_string();
    }
    let mut out = String::from("Context:\n");
    for hit in hits {
        out.push_str("\n---\n");
        if let Some(ref title) = hit.title {
            out.push_str(&format!("Title: {}\n", title));
        }
        if let Some(ref slug) = hit.slug {
            out.push_str(&format!("Slug: {}\n", slug));
        }
        out.push_str(&hit.content);
        out.push('\n');
    }
    out
}

/// One parsed server-sent event line.
#[derive(Debug, PartialEq)]
pub enum SseEvent {
    Delta(String),
    Done,
    Skip,
}

pub fn parse_sse_line(line: &str) -> Result<SseEvent> {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return Ok(SseEvent::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseEvent::Done);
    }
    let chunk: StreamChunk = serde_json::from_str(data).context("Invalid stream chunk")?;
    match chunk
        .choices
        .into_iter()
        .find_map(|choice| choice.delta.content)
    {
        Some(text) if !text.is_empty() => Ok(SseEvent::Delta(text)),
        _ => Ok(SseEvent::Skip),
    }
}

pub struct OpenAiGenerator {
    api_key: Option<String>,
    model: String,
    endpoint: String,
    system_prompt: String,
    client: reqwest::Client,
}

impl OpenAiGenerator {
    pub fn new(
        api_key: Option<String>,
        model: impl Into<String>,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build generation HTTP client")?;
        Ok(Self {
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            model: model.into(),
            endpoint: format!("{}/v1/chat/completions", base_url.trim_end_matches('/')),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            client,
        })
    }

    pub fn from_config(config: &GenerationConfig) -> Result<Self> {
        let mut generator = Self::new(
            std::env::var(API_KEY_ENV).ok(),
            config.model.clone(),
            &config.base_url,
            Duration::from_secs(config.timeout_secs),
        )?;
        if let Some(ref prompt) = config.system_prompt {
            generator.system_prompt = prompt.clone();
        }
        Ok(generator)
    }
}

#[async_trait]
impl ResponseGenerator for OpenAiGenerator {
    async fn stream_reply(
        &self,
        messages: &[PromptMessage],
        context: &[SearchHit],
    ) -> Result<mpsc::Receiver<Result<String>>> {
        let Some(ref api_key) = self.api_key else {
            bail!("{} is not set", API_KEY_ENV);
        };

        let system = format!("{}\n\n{}", self.system_prompt, build_context(context));
        let mut wire = Vec::with_capacity(messages.len() + 1);
        wire.push(WireMessage {
            role: "system",
            content: &system,
        });
        wire.extend(messages.iter().map(|m| WireMessage {
            role: m.role.as_str(),
            content: &m.content,
        }));

        let body = ChatRequest {
            model: &self.model,
            stream: true,
            messages: wire,
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key.trim())
            .json(&body)
            .send()
            .await
            .context("failed to call chat completions")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            bail!("completion endpoint returned {}: {}", status, text);
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(forward_stream(resp, tx));
        Ok(rx)
    }
}

async fn forward_stream(mut resp: reqwest::Response, tx: mpsc::Sender<Result<String>>) {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            match parse_sse_line(&line) {
                Ok(SseEvent::Delta(text)) => {
                    if tx.send(Ok(text)).await.is_err() {
                        debug!("reply receiver dropped, stopping stream");
                        return;
                    }
                }
                Ok(SseEvent::Done) => return,
                Ok(SseEvent::Skip) => {}
                Err(e) => {
                    warn!(error = %e, "skipping malformed stream event");
                }
            }
        }

        match resp.chunk().await {
            Ok(Some(bytes)) => buf.extend_from_slice(&bytes),
            Ok(None) => return,
            Err(e) => {
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    stream: bool,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}
