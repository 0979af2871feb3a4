use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::auth::extractor::AuthUser;
use crate::db;
use crate::error::AppError;
use crate::state::SharedState;

/// Frames buffered per socket before it counts as too slow and is dropped.
const SOCKET_BUFFER: usize = 64;

pub async fn stream(
    auth: AuthUser,
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> Result<Response, AppError> {
    // Tokens can outlive their user.
    match db::users::find_by_id(&state.pool, auth.user_id).await? {
        Some(user) if user.tenant_id == auth.tenant_id => {}
        _ => return Err(AppError::Unauthorized("Unknown user".to_string())),
    }

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, auth)))
}

async fn handle_socket(socket: WebSocket, state: SharedState, auth: AuthUser) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(SOCKET_BUFFER);

    let connection_id = state
        .live
        .attach(auth.tenant_id, auth.user_id, Arc::new(tx))
        .await;

    let mut writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    // Client frames carry nothing; read only to notice the close.
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    state.live.detach(auth.tenant_id, connection_id);
    tracing::debug!(tenant_id = %auth.tenant_id, %connection_id, "live socket closed");
}
