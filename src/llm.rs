//! Streaming client for an OpenAI-compatible chat-completions endpoint.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ArchiveError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// A single turn in the chat conversation.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    /// `system`, `user`, or `assistant`.
    pub role: &'static str,
    /// Turn content.
    pub content: String,
}

impl ChatMessage {
    /// Builds a system turn.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    /// Builds a user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }

    /// Builds an assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant",
            content: content.into(),
        }
    }
}

/// Sampling parameters for a completion call.
#[derive(Debug, Clone, Copy)]
pub struct ChatOptions {
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion token cap.
    pub max_tokens: usize,
    /// Context window hint forwarded to the runtime.
    pub num_ctx: usize,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_tokens: 500,
            num_ctx: 2048,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    temperature: f32,
    max_tokens: usize,
    num_ctx: usize,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Client for the language-model runtime.
#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    completions_url: String,
    health_url: String,
    model: String,
}

impl LlmClient {
    /// Builds a client for the runtime rooted at `base_url`.
    pub fn new(base_url: &str, model: &str) -> anyhow::Result<Self> {
        let base = base_url.trim_end_matches('/');
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build LLM HTTP client")?;
        Ok(Self {
            http,
            completions_url: format!("{base}/v1/chat/completions"),
            health_url: format!("{base}/health"),
            model: model.to_string(),
        })
    }

    /// Streams a completion, invoking `on_token` for every content delta.
    /// Returns the accumulated answer.
    pub async fn chat_stream<F>(
        &self,
        messages: &[ChatMessage],
        options: ChatOptions,
        mut on_token: F,
    ) -> Result<String>
    where
        F: FnMut(&str),
    {
        let request = ChatRequest {
            model: &self.model,
            messages,
            stream: true,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            num_ctx: options.num_ctx,
        };

        let response = self
            .http
            .post(&self.completions_url)
            .json(&request)
            .send()
            .await
            .map_err(|err| ArchiveError::LlmStream(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ArchiveError::LlmStream(format!("status {status}: {body}")));
        }

        let mut response = response;
        let mut parser = SseParser::default();
        let mut answer = String::new();

        'outer: while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| ArchiveError::LlmStream(err.to_string()))?
        {
            let text = String::from_utf8_lossy(&chunk);
            for delta in parser.push(&text)? {
                match delta {
                    SseDelta::Content(token) => {
                        on_token(&token);
                        answer.push_str(&token);
                    }
                    SseDelta::Done => break 'outer,
                }
            }
        }

        debug!(answer_chars = answer.len(), "completion stream finished");
        Ok(answer)
    }

    /// Probes the runtime health endpoint.
    pub async fn health(&self) -> Result<()> {
        let response = self
            .http
            .get(&self.health_url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|err| ArchiveError::LlmStream(err.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ArchiveError::LlmStream(format!(
                "health returned {}",
                response.status()
            )))
        }
    }
}

enum SseDelta {
    Content(String),
    Done,
}

/// Incremental parser over the SSE byte stream: events are separated by
/// blank lines, `data:` lines carry either `[DONE]` or a JSON chunk.
#[derive(Default)]
struct SseParser {
    buffer: String,
}

impl SseParser {
    fn push(&mut self, text: &str) -> Result<Vec<SseDelta>> {
        self.buffer.push_str(text);
        let mut deltas = Vec::new();

        while let Some(split) = self.buffer.find("\n\n") {
            let event: String = self.buffer.drain(..split + 2).collect();
            for line in event.lines() {
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    deltas.push(SseDelta::Done);
                    continue;
                }
                let chunk: StreamChunk = serde_json::from_str(data).map_err(|err| {
                    ArchiveError::LlmStream(format!("bad stream payload: {err}"))
                })?;
                if let Some(content) = chunk
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.delta.content)
                {
                    if !content.is_empty() {
                        deltas.push(SseDelta::Content(content));
                    }
                }
            }
        }
        Ok(deltas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents(deltas: Vec<SseDelta>) -> (Vec<String>, bool) {
        let mut tokens = Vec::new();
        let mut done = false;
        for delta in deltas {
            match delta {
                SseDelta::Content(token) => tokens.push(token),
                SseDelta::Done => done = true,
            }
        }
        (tokens, done)
    }

    #[test]
    fn parses_tokens_and_done_marker() {
        let mut parser = SseParser::default();
        let input = "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
                     data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n\
                     data: [DONE]\n\n";
        let (tokens, done) = contents(parser.push(input).unwrap());
        assert_eq!(tokens, vec!["Hel", "lo"]);
        assert!(done);
    }

    #[test]
    fn handles_events_split_across_chunks() {
        let mut parser = SseParser::default();
        let (tokens, _) = contents(
            parser
                .push("data: {\"choices\":[{\"delta\":{\"con")
                .unwrap(),
        );
        assert!(tokens.is_empty());
        let (tokens, _) = contents(
            parser
                .push("tent\":\"Hi\"}}]}\n\ndata: [DONE]\n\n")
                .unwrap(),
        );
        assert_eq!(tokens, vec!["Hi"]);
    }

    #[test]
    fn empty_deltas_are_skipped() {
        let mut parser = SseParser::default();
        let (tokens, done) =
            contents(parser.push("data: {\"choices\":[{\"delta\":{}}]}\n\n").unwrap());
        assert!(tokens.is_empty());
        assert!(!done);
    }

    #[test]
    fn malformed_json_is_an_error() {
        let mut parser = SseParser::default();
        assert!(parser.push("data: {not json}\n\n").is_err());
    }
}
