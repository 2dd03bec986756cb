use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::{
    realtime::{
        events::{ClientEvent, ServerEvent},
        session::Session,
    },
    AppState,
};

/// Upgrade endpoint. Authentication happens in-band with the first
/// `authenticate` event, so this route sits outside the bearer middleware.
pub async fn handle_websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let session = state.session();
    ws.on_upgrade(move |socket| handle_socket(socket, session))
}

async fn handle_socket(socket: WebSocket, session: Session) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (client_tx, inbound) = mpsc::unbounded_channel::<ClientEvent>();
    let (outbound, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    // The session owns room membership and unregisters itself when the
    // inbound side closes.
    tokio::spawn(session.run(inbound, outbound));

    // Task to send events to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!("Failed to encode server event: {}", e),
            }
        }
        let _ = ws_sender.close().await;
    });

    // Task to receive events from WebSocket
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => {
                        if client_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("Ignoring unparseable frame: {}", e),
                },
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => {},
    }
    tracing::debug!("WebSocket closed");
}
