//! Long-lived socket namespaces.
//!
//! `/ws/chat` carries conversation streams; `/ws/local-executor`
//! carries device registration and task relay. Both share the frame
//! envelope, the JWT handshake, and the room registry.

pub mod chat;
pub mod device;
pub mod rooms;

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::StreamExt;

use tm_protocol::{AuthPayload, Frame};

use crate::auth::UserClaims;
use crate::state::AppState;

/// How long a fresh socket gets to present credentials.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Wait for the initial `auth` frame and validate its token.
/// Returns None on timeout, close, or invalid credentials.
pub(crate) async fn wait_for_auth(
    stream: &mut SplitStream<WebSocket>,
    state: &AppState,
) -> Option<UserClaims> {
    let handshake = tokio::time::timeout(AUTH_TIMEOUT, async {
        while let Some(Ok(message)) = stream.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            let Ok(frame) = Frame::parse(&text) else {
                continue;
            };
            if frame.event != "auth" {
                continue;
            }
            let payload: AuthPayload = serde_json::from_value(frame.data).ok()?;
            return state.minter.verify_user_token(&payload.token).ok();
        }
        None
    })
    .await;

    match handshake {
        Ok(Some(claims)) => Some(claims),
        Ok(None) => {
            tracing::warn!("socket failed authentication");
            None
        }
        Err(_) => {
            tracing::warn!("socket authentication timed out");
            None
        }
    }
}

/// Spawn the writer task draining a frame channel into the WS sink.
pub(crate) fn spawn_writer(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: tokio::sync::mpsc::Receiver<Frame>,
) -> tokio::task::JoinHandle<()> {
    use futures_util::SinkExt;
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame.to_json())).await.is_err() {
                break;
            }
        }
    })
}
