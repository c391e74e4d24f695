//! WebSocket transport for the pairing bridge.

use std::sync::Arc;

use {
    axum::{
        extract::{
            Path, Query, State, WebSocketUpgrade,
            ws::{Message, WebSocket},
        },
        http::HeaderMap,
        response::Response,
    },
    futures::{SinkExt, StreamExt},
    serde::Deserialize,
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use crate::{
    auth,
    error::{GatewayError, GatewayResult},
    pairing::{PairingFrame, PairingGuard, run_pairing},
    state::GatewayState,
};

const FRAME_BUFFER: usize = 16;

#[derive(Debug, Default, Deserialize)]
pub struct PairingQuery {
    pub token: Option<String>,
}

/// `GET /ws/{id}`. Browsers cannot set headers on a WebSocket handshake,
/// so the token may also arrive as `?token=`.
pub async fn pairing_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    Query(query): Query<PairingQuery>,
    headers: HeaderMap,
) -> GatewayResult<Response> {
    let token = query
        .token
        .as_deref()
        .or_else(|| auth::bearer_token(&headers))
        .ok_or_else(|| GatewayError::Unauthorized("missing token".into()))?;
    state.signer.verify(token)?;

    // Claim the slot before upgrading so a second browser gets a plain 409.
    let guard = state.registry.begin_pairing(&id)?;
    info!(session_id = %id, "pairing socket opened");
    Ok(ws.on_upgrade(move |socket| handle_pairing_socket(socket, state, guard)))
}

async fn handle_pairing_socket(socket: WebSocket, state: Arc<GatewayState>, guard: PairingGuard) {
    let session_id = guard.session().id().to_string();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<PairingFrame>(FRAME_BUFFER);

    let bridge = tokio::spawn(run_pairing(
        state.registry.clone(),
        guard,
        tx,
        state.config.pairing.timeout(),
    ));

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "failed to encode pairing frame");
                        continue;
                    },
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    debug!(session_id = %session_id, "pairing socket send failed");
                    break;
                }
            },
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    // Nothing to read from the browser; pings are answered by axum.
                    Some(Ok(_)) => {},
                }
            },
        }
    }

    // Dropping the receiver makes the bridge cancel if it is still running.
    drop(rx);
    match bridge.await {
        Ok(phase) => info!(session_id = %session_id, ?phase, "pairing socket closed"),
        Err(e) => warn!(session_id = %session_id, error = %e, "pairing task failed"),
    }
    let _ = sink.send(Message::Close(None)).await;
}
