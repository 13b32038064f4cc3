//! WebSocket entry point (C5). One task per connection owns the receive
//! loop; a second task owns the send side so the dispatcher and a spawned
//! subscription task (`session::dispatch`) can both write without sharing
//! the `SplitSink`, grounded on `ws_forwarder.rs`'s split-socket handling.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::info;

use crate::session::{self, ConnectionState};
use crate::state::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = outbox_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let conn = Arc::new(ConnectionState::new());

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(_) => break,
        };

        match fx_protocol::decode_frame(&text) {
            fx_protocol::FrameDecode::NotJson => {
                let _ = outbox_tx.send(Message::Text("Could not parse the JSON command".into()));
            }
            fx_protocol::FrameDecode::NotAnObject(value) => {
                let message = format!(
                    "Invalid type of the message: {}. Command must be a valid JSON mapping",
                    fx_protocol::json_type_name(&value)
                );
                let _ = outbox_tx.send(Message::Text(message.into()));
            }
            fx_protocol::FrameDecode::Invalid(errors) => {
                if let Ok(json) = serde_json::to_string(&fx_protocol::bare_errors(errors)) {
                    let _ = outbox_tx.send(Message::Text(json.into()));
                }
            }
            fx_protocol::FrameDecode::Command(cmd) => {
                session::dispatch(&state.pool, &conn, &outbox_tx, &cmd.action, &cmd.message).await;
            }
        }
    }

    conn.cancel_all_tasks().await;
    drop(outbox_tx);
    let _ = writer.await;
    info!("connection closed");
}
