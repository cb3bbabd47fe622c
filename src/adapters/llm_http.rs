//! HTTP-based LLM adapter for OpenAI-compatible chat completion APIs.
//!
//! Works against any server implementing the `/v1/chat/completions`
//! streaming SSE contract: OpenAI, a local Ollama/vLLM instance, etc.

use crate::adapters::{ChatMessage, ChatRole, LlmAdapter};
use crate::error::{ControllerError, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// LLM backend talking to an OpenAI-compatible HTTP API over SSE.
pub struct HttpLlmAdapter {
    client: reqwest::Client,
    api_url: String,
    model: String,
    api_key: String,
    temperature: f32,
    max_tokens: u32,
}

impl HttpLlmAdapter {
    /// Create a new adapter. `api_url` is the base URL, e.g.
    /// `https://api.openai.com/v1` or `http://localhost:11434/v1`.
    pub fn new(api_url: impl Into<String>, model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
            model: model.into(),
            api_key: api_key.into(),
            temperature: 0.7,
            max_tokens: 512,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn completions_url(&self) -> String {
        let base = self.api_url.trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }
}

fn role_str(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
    }
}

#[async_trait]
impl LlmAdapter for HttpLlmAdapter {
    async fn warm_up(&self) -> Result<()> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 1,
            "stream": false,
        });
        let mut req = self.client.post(self.completions_url()).json(&body);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        req.send()
            .await
            .map_err(|e| ControllerError::LlmConnectionFailed(e.to_string()))?;
        info!("LLM adapter warmed up: {}", self.api_url);
        Ok(())
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        let payload_messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| serde_json::json!({ "role": role_str(m.role), "content": m.content }))
            .collect();

        let body = serde_json::json!({
            "model": self.model,
            "messages": payload_messages,
            "stream": true,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });

        let mut req = self.client.post(self.completions_url()).json(&body);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| ControllerError::LlmConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ControllerError::LlmConnectionFailed(format!("HTTP {status}: {text}")));
        }

        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break;
                    }
                    chunk = byte_stream.next() => {
                        let Some(chunk) = chunk else { break };
                        let bytes = match chunk {
                            Ok(b) => b,
                            Err(e) => {
                                let _ = tx.send(Err(ControllerError::LlmConnectionFailed(e.to_string()))).await;
                                break;
                            }
                        };
                        buffer.push_str(&String::from_utf8_lossy(&bytes));

                        while let Some(pos) = buffer.find('\n') {
                            let line = buffer[..pos].trim_end_matches('\r').to_owned();
                            buffer = buffer[pos + 1..].to_owned();

                            if line.is_empty() {
                                continue;
                            }
                            let Some(data) = line.strip_prefix("data: ") else { continue };
                            if data == "[DONE]" {
                                return;
                            }

                            let parsed: serde_json::Value = match serde_json::from_str(data) {
                                Ok(v) => v,
                                Err(e) => {
                                    warn!("SSE chunk parse failed: {e}");
                                    continue;
                                }
                            };

                            if let Some(content) = parsed["choices"][0]["delta"]["content"].as_str() {
                                if !content.is_empty() && tx.send(Ok(content.to_owned())).await.is_err() {
                                    return;
                                }
                            }

                            if parsed["choices"][0]["finish_reason"].as_str().is_some_and(|r| r != "null") {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completions_url_appends_v1_when_missing() {
        let a = HttpLlmAdapter::new("http://localhost:11434", "llama3", "");
        assert_eq!(a.completions_url(), "http://localhost:11434/v1/chat/completions");
    }

    #[test]
    fn completions_url_respects_existing_v1() {
        let a = HttpLlmAdapter::new("https://api.openai.com/v1", "gpt-4o-mini", "sk-test");
        assert_eq!(a.completions_url(), "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn builder_overrides_defaults() {
        let a = HttpLlmAdapter::new("http://x", "m", "").with_temperature(0.2).with_max_tokens(64);
        assert_eq!(a.temperature, 0.2);
        assert_eq!(a.max_tokens, 64);
    }
}
