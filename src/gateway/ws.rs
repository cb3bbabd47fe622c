//! WebSocket upgrade handler: one [`crate::turn::TurnController`] per
//! connection, driven by the client-transport message catalogue.

use super::{GatewayState, bearer_is_valid, unauthorized};
use crate::gateway::transport::WsTransport;
use crate::turn::{ClientMessage, TurnController, TurnControllerSettingsInit};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use base64::Engine;
use futures_util::StreamExt;
use std::sync::Arc;
use tracing::{info, warn};

pub async fn upgrade(
    State(state): State<GatewayState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !bearer_is_valid(&headers, &state.bearer_token) {
        return unauthorized();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state))
}

async fn handle_socket(socket: WebSocket, session_id: String, state: GatewayState) {
    let (sender, mut receiver) = socket.split();
    let transport = Arc::new(WsTransport::new(sender));

    let stt = (state.stt_factory)();
    let controller = TurnController::new(
        session_id.clone(),
        stt,
        Arc::clone(&state.llm),
        Arc::clone(&state.tts),
        transport,
        Arc::clone(&state.retriever),
        state.repository.clone(),
        TurnControllerSettingsInit::default(),
    );

    controller.start().await;

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                warn!("ws recv error for session {session_id}: {e}");
                break;
            }
        };

        let text = match frame {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => continue,
        };

        let message: ClientMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                warn!("malformed client message on session {session_id}: {e}");
                continue;
            }
        };

        dispatch(&controller, message).await;
    }

    controller.stop().await;
    info!("ws session {session_id} closed");
}

async fn dispatch(controller: &Arc<TurnController>, message: ClientMessage) {
    match message {
        ClientMessage::Connect => {}
        ClientMessage::AudioChunk { audio, format, sample_rate } => {
            match base64::engine::general_purpose::STANDARD.decode(audio) {
                Ok(bytes) => controller.handle_audio_chunk(&bytes, format, sample_rate).await,
                Err(e) => warn!("invalid base64 audio_chunk: {e}"),
            }
        }
        ClientMessage::Interrupt { .. } => controller.handle_interrupt().await,
        ClientMessage::UpdateSettings {
            silence_debounce_ms,
            cancellation_threshold,
            adaptive_debounce_enabled,
            voice_id,
            llm_model,
        } => {
            controller
                .update_settings(silence_debounce_ms, cancellation_threshold, adaptive_debounce_enabled, voice_id, llm_model)
                .await;
        }
        ClientMessage::Disconnect => controller.stop().await,
        ClientMessage::GetHistory => controller.handle_get_history().await,
        ClientMessage::Ping | ClientMessage::Pong => {}
    }
}
