//! WebSocket feed of processed events.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use tracing::{debug, instrument};

use crate::{broadcast::BroadcastSession, AppState};

/// Close code sent when the hub is full or shutting down.
const TRY_AGAIN_LATER: u16 = 1013;

/// Upgrades to a WebSocket streaming `event_processed` frames.
///
/// When no session slot is free the upgrade completes and the socket is
/// closed straight away with code 1013.
#[instrument(name = "subscribe", skip_all)]
pub async fn subscribe(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    match state.broadcaster.open_session() {
        Some(session) => upgrade.on_upgrade(move |socket| stream(socket, session)),
        None => upgrade.on_upgrade(reject),
    }
}

async fn reject(mut socket: WebSocket) {
    let frame = CloseFrame { code: TRY_AGAIN_LATER, reason: "subscriber limit reached".into() };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

async fn stream(mut socket: WebSocket, mut session: BroadcastSession) {
    debug!("subscriber connected");
    loop {
        tokio::select! {
            frame = session.next_frame() => {
                let Some(frame) = frame else {
                    let close = CloseFrame { code: TRY_AGAIN_LATER, reason: "server shutting down".into() };
                    let _ = socket.send(Message::Close(Some(close))).await;
                    break;
                };
                if socket.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {},
            },
        }
    }
    debug!("subscriber disconnected");
}
