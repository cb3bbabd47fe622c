//! In-memory test doubles for the adapter traits.
//!
//! Used by controller-level tests so the orchestration logic can be
//! exercised without real STT/LLM/TTS/transport network dependencies.

use crate::adapters::{ChatMessage, LlmAdapter, SttAdapter, Transport, TtsAdapter};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Records audio pushed to it; never emits events on its own. Tests drive
/// the controller directly via its `handle_*` entry points instead of
/// waiting on this double to produce [`crate::adapters::SttEvent`]s.
pub struct TestSttAdapter {
    pub sent_audio: Mutex<Vec<Vec<u8>>>,
    pub finished: Mutex<bool>,
    pub disconnected: Mutex<bool>,
}

impl TestSttAdapter {
    pub fn new() -> Self {
        Self {
            sent_audio: Mutex::new(Vec::new()),
            finished: Mutex::new(false),
            disconnected: Mutex::new(false),
        }
    }
}

impl Default for TestSttAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SttAdapter for TestSttAdapter {
    async fn send_audio(&self, audio: &[u8]) -> Result<()> {
        self.sent_audio.lock().expect("lock").push(audio.to_vec());
        Ok(())
    }

    async fn finish_utterance(&self) -> Result<()> {
        *self.finished.lock().expect("lock") = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        *self.disconnected.lock().expect("lock") = true;
        Ok(())
    }
}

/// Streams back a fixed canned response, one word per yielded fragment.
pub struct TestLlmAdapter {
    pub response: String,
    pub warmed_up: Mutex<bool>,
    /// Every message list this adapter was asked to stream, in call order —
    /// lets controller tests assert interim transcripts never reach the LLM.
    pub sent_messages: Mutex<Vec<Vec<ChatMessage>>>,
}

impl TestLlmAdapter {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            warmed_up: Mutex::new(false),
            sent_messages: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LlmAdapter for TestLlmAdapter {
    async fn warm_up(&self) -> Result<()> {
        *self.warmed_up.lock().expect("lock") = true;
        Ok(())
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        self.sent_messages.lock().expect("lock").push(messages);
        let (tx, rx) = mpsc::channel(16);
        let words: Vec<String> = self.response.split_whitespace().map(|w| format!("{w} ")).collect();

        tokio::spawn(async move {
            for word in words {
                if cancel.is_cancelled() {
                    return;
                }
                if tx.send(Ok(word)).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}

/// Yields one fixed audio chunk per call to `synthesize`.
pub struct TestTtsAdapter {
    pub chunk: Vec<u8>,
    pub warmed_up: Mutex<bool>,
    pub synthesized: Mutex<Vec<String>>,
}

impl TestTtsAdapter {
    pub fn new(chunk: Vec<u8>) -> Self {
        Self {
            chunk,
            warmed_up: Mutex::new(false),
            synthesized: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl TtsAdapter for TestTtsAdapter {
    async fn warm_up(&self) -> Result<()> {
        *self.warmed_up.lock().expect("lock") = true;
        Ok(())
    }

    async fn synthesize(&self, text: &str, cancel: CancellationToken) -> Result<mpsc::Receiver<Result<Vec<u8>>>> {
        self.synthesized.lock().expect("lock").push(text.to_owned());
        let (tx, rx) = mpsc::channel(4);
        let chunk = self.chunk.clone();

        tokio::spawn(async move {
            if cancel.is_cancelled() {
                return;
            }
            let _ = tx.send(Ok(chunk)).await;
        });

        Ok(rx)
    }
}

/// Records every message sent to it, keyed by session id.
pub struct TestTransport {
    pub sent: Mutex<Vec<(String, serde_json::Value)>>,
}

impl TestTransport {
    pub fn new() -> Self {
        Self { sent: Mutex::new(Vec::new()) }
    }

    pub fn messages_for(&self, session_id: &str) -> Vec<serde_json::Value> {
        self.sent
            .lock()
            .expect("lock")
            .iter()
            .filter(|(s, _)| s == session_id)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

impl Default for TestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TestTransport {
    async fn send(&self, session_id: &str, message: serde_json::Value) -> Result<()> {
        self.sent.lock().expect("lock").push((session_id.to_owned(), message));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ChatRole;

    #[tokio::test]
    async fn test_llm_streams_canned_response() {
        let adapter = TestLlmAdapter::new("hello there");
        let cancel = CancellationToken::new();
        let mut rx = adapter
            .stream(vec![ChatMessage { role: ChatRole::User, content: "hi".into() }], cancel)
            .await
            .expect("stream");

        let mut collected = String::new();
        while let Some(chunk) = rx.recv().await {
            collected.push_str(&chunk.expect("chunk"));
        }
        assert_eq!(collected.trim(), "hello there");
    }

    #[tokio::test]
    async fn test_tts_yields_one_chunk() {
        let adapter = TestTtsAdapter::new(vec![1, 2, 3]);
        let cancel = CancellationToken::new();
        let mut rx = adapter.synthesize("hello", cancel).await.expect("synthesize");
        let chunk = rx.recv().await.expect("chunk").expect("ok");
        assert_eq!(chunk, vec![1, 2, 3]);
        assert_eq!(adapter.synthesized.lock().expect("lock").as_slice(), ["hello".to_owned()]);
    }

    #[tokio::test]
    async fn test_transport_records_messages() {
        let transport = TestTransport::new();
        transport.send("session-1", serde_json::json!({"type": "ping"})).await.expect("send");
        let msgs = transport.messages_for("session-1");
        assert_eq!(msgs.len(), 1);
        assert!(transport.messages_for("session-2").is_empty());
    }

    #[tokio::test]
    async fn test_stt_records_audio() {
        let adapter = TestSttAdapter::new();
        adapter.send_audio(&[1, 2, 3]).await.expect("send");
        adapter.finish_utterance().await.expect("finish");
        assert_eq!(adapter.sent_audio.lock().expect("lock").len(), 1);
        assert!(*adapter.finished.lock().expect("lock"));
    }
}
