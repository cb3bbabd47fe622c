//! [`crate::adapters::Transport`] implementation over a WebSocket sink.

use crate::adapters::Transport;
use crate::error::{ControllerError, Result};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::SinkExt;
use futures_util::stream::SplitSink;
use tokio::sync::Mutex;

/// Serializes outbound [`crate::turn::ServerMessage`] values (already
/// converted to JSON by the controller) onto one client's WebSocket.
pub struct WsTransport {
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

impl WsTransport {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self { sink: Mutex::new(sink) }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, _session_id: &str, message: serde_json::Value) -> Result<()> {
        let text = serde_json::to_string(&message).map_err(|e| ControllerError::Channel(e.to_string()))?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text.into())).await.map_err(|e| ControllerError::Channel(e.to_string()))
    }
}
